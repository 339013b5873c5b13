//! Switching the real, effective and saved user/group ids.
//!
//! A privileged caller (effective id 0) moves all three ids to the target unconditionally.
//! An unprivileged caller only touches the slots that differ from the target, and skips the
//! saved slot when the last id it moved there already equals the target. That last id is kept
//! in a [`PrivilegeState`] owned by [`Privileges`], so the decision can be tested without
//! touching the process credentials.

use nix::{
    errno::Errno,
    unistd::{self, Gid, Uid},
};

use crate::Error;

pub const SUPERUSER: u32 = 0;

/// `(uid_t)-1` / `(gid_t)-1`: leave this slot unchanged.
const UNCHANGED: u32 = u32::MAX;

/// The ids to write for one `setres[ug]id` call. `None` leaves a slot unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IdChange {
    pub real: Option<u32>,
    pub effective: Option<u32>,
    pub saved: Option<u32>,
}

impl IdChange {
    #[must_use]
    pub const fn all(id: u32) -> Self {
        Self {
            real: Some(id),
            effective: Some(id),
            saved: Some(id),
        }
    }

    #[must_use]
    pub const fn is_noop(&self) -> bool {
        self.real.is_none() && self.effective.is_none() && self.saved.is_none()
    }

    /// Computes the change needed to move every slot to `target`.
    #[must_use]
    pub fn plan(real: u32, effective: u32, last_saved: Option<u32>, target: u32) -> Self {
        if effective == SUPERUSER {
            return Self::all(target);
        }

        let differs = |current: Option<u32>| (current != Some(target)).then_some(target);

        Self {
            real: differs(Some(real)),
            effective: differs(Some(effective)),
            saved: differs(last_saved),
        }
    }
}

/// Remembers the last user and group ids moved into the saved slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrivilegeState {
    pub last_saved_uid: Option<u32>,
    pub last_saved_gid: Option<u32>,
}

/// Reads and writes process credentials.
pub trait CredentialProvider {
    fn real_uid(&self) -> u32;
    fn effective_uid(&self) -> u32;
    fn real_gid(&self) -> u32;
    fn effective_gid(&self) -> u32;

    /// # Errors
    ///
    /// * If the kernel refuses the change
    fn set_res_uid(&mut self, change: IdChange) -> Result<(), Errno>;

    /// # Errors
    ///
    /// * If the kernel refuses the change
    fn set_res_gid(&mut self, change: IdChange) -> Result<(), Errno>;
}

/// The calling process's own credentials.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCredentials;

impl CredentialProvider for SystemCredentials {
    fn real_uid(&self) -> u32 {
        unistd::getuid().as_raw()
    }

    fn effective_uid(&self) -> u32 {
        unistd::geteuid().as_raw()
    }

    fn real_gid(&self) -> u32 {
        unistd::getgid().as_raw()
    }

    fn effective_gid(&self) -> u32 {
        unistd::getegid().as_raw()
    }

    fn set_res_uid(&mut self, change: IdChange) -> Result<(), Errno> {
        let id = |x: Option<u32>| Uid::from_raw(x.unwrap_or(UNCHANGED));
        unistd::setresuid(id(change.real), id(change.effective), id(change.saved))
    }

    fn set_res_gid(&mut self, change: IdChange) -> Result<(), Errno> {
        let id = |x: Option<u32>| Gid::from_raw(x.unwrap_or(UNCHANGED));
        unistd::setresgid(id(change.real), id(change.effective), id(change.saved))
    }
}

/// Owns a [`CredentialProvider`] together with the [`PrivilegeState`] it mutates.
///
/// Switching takes `&mut self`, so sharing one instance across threads needs a lock around it.
#[derive(Debug, Default)]
pub struct Privileges<P: CredentialProvider = SystemCredentials> {
    provider: P,
    state: PrivilegeState,
}

impl Privileges<SystemCredentials> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_provider(SystemCredentials)
    }
}

impl<P: CredentialProvider> Privileges<P> {
    #[must_use]
    pub fn with_provider(provider: P) -> Self {
        Self {
            provider,
            state: PrivilegeState::default(),
        }
    }

    #[must_use]
    pub const fn state(&self) -> PrivilegeState {
        self.state
    }

    #[must_use]
    pub const fn provider(&self) -> &P {
        &self.provider
    }

    /// Moves the real, effective and saved user ids to `uid`.
    ///
    /// # Errors
    ///
    /// * If the kernel refuses the change; the remembered saved id is left as it was
    pub fn switch_user_id(&mut self, uid: u32) -> Result<(), Error> {
        let change = IdChange::plan(
            self.provider.real_uid(),
            self.provider.effective_uid(),
            self.state.last_saved_uid,
            uid,
        );
        log::debug!("switch_user_id: uid={uid} change={change:?}");

        if !change.is_noop() {
            self.provider
                .set_res_uid(change)
                .map_err(|errno| Error::SwitchUser { uid, errno })?;
        }
        self.state.last_saved_uid = Some(uid);

        Ok(())
    }

    /// Moves the real, effective and saved group ids to `gid`.
    ///
    /// # Errors
    ///
    /// * If the kernel refuses the change; the remembered saved id is left as it was
    pub fn switch_group_id(&mut self, gid: u32) -> Result<(), Error> {
        let change = IdChange::plan(
            self.provider.real_gid(),
            self.provider.effective_gid(),
            self.state.last_saved_gid,
            gid,
        );
        log::debug!("switch_group_id: gid={gid} change={change:?}");

        if !change.is_noop() {
            self.provider
                .set_res_gid(change)
                .map_err(|errno| Error::SwitchGroup { gid, errno })?;
        }
        self.state.last_saved_gid = Some(gid);

        Ok(())
    }
}
