//! Process ids and user/group directory records.

use std::path::PathBuf;

use nix::unistd::{self, Group, User};

use crate::Error;

/// Snapshot of a password database entry.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct UserRecord {
    pub name: String,
    pub passwd: String,
    pub uid: u32,
    pub gid: u32,
    pub gecos: String,
    pub dir: PathBuf,
    pub shell: PathBuf,
}

/// Snapshot of a group database entry.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct GroupRecord {
    pub name: String,
    pub passwd: String,
    pub gid: u32,
    pub members: Vec<String>,
}

impl From<User> for UserRecord {
    fn from(value: User) -> Self {
        Self {
            name: value.name,
            passwd: value.passwd.to_string_lossy().into_owned(),
            uid: value.uid.as_raw(),
            gid: value.gid.as_raw(),
            gecos: value.gecos.to_string_lossy().into_owned(),
            dir: value.dir,
            shell: value.shell,
        }
    }
}

impl From<Group> for GroupRecord {
    fn from(value: Group) -> Self {
        Self {
            name: value.name,
            passwd: value.passwd.to_string_lossy().into_owned(),
            gid: value.gid.as_raw(),
            members: value.mem,
        }
    }
}

/// Looks up a user by name. A missing entry is `Ok(None)`.
///
/// # Errors
///
/// * If the password database couldn't be read
pub fn lookup_user(name: &str) -> Result<Option<UserRecord>, Error> {
    if name.contains('\0') {
        return Ok(None);
    }
    let user = User::from_name(name).map_err(|errno| Error::Lookup {
        name: name.to_string(),
        errno,
    })?;
    log::trace!("lookup_user: name={name} found={}", user.is_some());

    Ok(user.map(Into::into))
}

/// Looks up a group by name. A missing entry is `Ok(None)`.
///
/// # Errors
///
/// * If the group database couldn't be read
pub fn lookup_group(name: &str) -> Result<Option<GroupRecord>, Error> {
    if name.contains('\0') {
        return Ok(None);
    }
    let group = Group::from_name(name).map_err(|errno| Error::Lookup {
        name: name.to_string(),
        errno,
    })?;
    log::trace!("lookup_group: name={name} found={}", group.is_some());

    Ok(group.map(Into::into))
}

#[must_use]
pub fn get_pid() -> i32 {
    unistd::getpid().as_raw()
}

#[must_use]
pub fn get_ppid() -> i32 {
    unistd::getppid().as_raw()
}

#[must_use]
pub fn get_euid() -> u32 {
    unistd::geteuid().as_raw()
}

#[must_use]
pub fn get_egid() -> u32 {
    unistd::getegid().as_raw()
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test_log::test]
    fn lookup_user_returns_none_for_missing_user() {
        assert_eq!(lookup_user("reaper-no-such-user-4d2f").unwrap(), None);
    }

    #[test_log::test]
    fn lookup_group_returns_none_for_missing_group() {
        assert_eq!(lookup_group("reaper-no-such-group-4d2f").unwrap(), None);
    }

    #[test_log::test]
    fn lookup_with_interior_nul_is_not_found() {
        assert_eq!(lookup_user("ro\0ot").unwrap(), None);
        assert_eq!(lookup_group("ro\0ot").unwrap(), None);
    }

    #[test_log::test]
    fn lookup_user_finds_root() {
        let root = lookup_user("root").unwrap().expect("root should exist");
        assert_eq!(root.uid, 0);
        assert_eq!(root.name, "root");
    }

    #[test_log::test]
    fn lookup_group_members_are_counted_correctly() {
        let group = lookup_group("root").unwrap().expect("root group should exist");
        assert_eq!(group.gid, 0);
        assert!(group.members.iter().all(|member| !member.is_empty()));
    }

    #[test_log::test]
    fn current_ids_match_std() {
        assert_eq!(u32::try_from(get_pid()).unwrap(), std::process::id());
        assert!(get_ppid() > 0);
    }

    #[cfg(feature = "serde")]
    #[test_log::test]
    fn user_record_serializes_to_json() {
        let record = UserRecord {
            name: "svc".to_string(),
            passwd: "x".to_string(),
            uid: 990,
            gid: 990,
            gecos: String::new(),
            dir: PathBuf::from("/var/lib/svc"),
            shell: PathBuf::from("/sbin/nologin"),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["uid"], 990);
        assert_eq!(json["dir"], "/var/lib/svc");
    }
}
