//! In-memory credentials for testing privilege transitions.
//!
//! [`SimulatedCredentials`] applies the same permission rule as `setresuid(2)`: a caller whose
//! effective user id is 0 may set any id, everyone else may only set a slot to one of its
//! current real, effective or saved ids.

use nix::errno::Errno;

use crate::privilege::{CredentialProvider, IdChange, SUPERUSER};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdTriple {
    pub real: u32,
    pub effective: u32,
    pub saved: u32,
}

impl IdTriple {
    #[must_use]
    pub const fn same(id: u32) -> Self {
        Self {
            real: id,
            effective: id,
            saved: id,
        }
    }

    const fn contains(&self, id: u32) -> bool {
        self.real == id || self.effective == id || self.saved == id
    }

    fn apply(&mut self, change: IdChange) {
        if let Some(real) = change.real {
            self.real = real;
        }
        if let Some(effective) = change.effective {
            self.effective = effective;
        }
        if let Some(saved) = change.saved {
            self.saved = saved;
        }
    }
}

/// Credentials held in memory, recording every change requested of them.
#[derive(Debug, Clone)]
pub struct SimulatedCredentials {
    uids: IdTriple,
    gids: IdTriple,
    uid_calls: Vec<IdChange>,
    gid_calls: Vec<IdChange>,
}

impl SimulatedCredentials {
    #[must_use]
    pub const fn new(uids: IdTriple, gids: IdTriple) -> Self {
        Self {
            uids,
            gids,
            uid_calls: vec![],
            gid_calls: vec![],
        }
    }

    #[must_use]
    pub const fn uids(&self) -> IdTriple {
        self.uids
    }

    #[must_use]
    pub const fn gids(&self) -> IdTriple {
        self.gids
    }

    #[must_use]
    pub fn uid_calls(&self) -> &[IdChange] {
        &self.uid_calls
    }

    #[must_use]
    pub fn gid_calls(&self) -> &[IdChange] {
        &self.gid_calls
    }

    const fn privileged(&self) -> bool {
        self.uids.effective == SUPERUSER
    }

    fn permitted(&self, current: &IdTriple, change: &IdChange) -> bool {
        self.privileged()
            || [change.real, change.effective, change.saved]
                .into_iter()
                .flatten()
                .all(|id| current.contains(id))
    }
}

impl CredentialProvider for SimulatedCredentials {
    fn real_uid(&self) -> u32 {
        self.uids.real
    }

    fn effective_uid(&self) -> u32 {
        self.uids.effective
    }

    fn real_gid(&self) -> u32 {
        self.gids.real
    }

    fn effective_gid(&self) -> u32 {
        self.gids.effective
    }

    fn set_res_uid(&mut self, change: IdChange) -> Result<(), Errno> {
        self.uid_calls.push(change);
        if !self.permitted(&self.uids, &change) {
            return Err(Errno::EPERM);
        }
        self.uids.apply(change);
        Ok(())
    }

    fn set_res_gid(&mut self, change: IdChange) -> Result<(), Errno> {
        self.gid_calls.push(change);
        if !self.permitted(&self.gids, &change) {
            return Err(Errno::EPERM);
        }
        self.gids.apply(change);
        Ok(())
    }
}
