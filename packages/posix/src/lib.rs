#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! # `reaper_posix`
//!
//! Thin wrappers over the POSIX calls a process supervisor needs:
//!
//! *   [`process`]: fork, signal delivery, exec, sessions, standard-stream redirection and
//!     permission probing
//! *   [`identity`]: process ids and user/group directory lookups
//! *   [`privilege`]: switching real, effective and saved user/group ids
//! *   [`status`]: decoding termination statuses
//!
//! None of these keep state of their own except [`privilege::PrivilegeState`], which is an
//! explicit value owned by the caller.

use nix::errno::Errno;
use thiserror::Error;

pub mod identity;
pub mod privilege;
pub mod process;
pub mod status;

#[cfg(feature = "simulator")]
pub mod simulator;

pub use nix::sys::signal::Signal;
pub use nix::unistd::Pid;

pub use status::Termination;

#[derive(Debug, Error)]
pub enum Error {
    #[error("couldn't fork process: {0}")]
    Fork(Errno),
    #[error("couldn't send {signal} to process {pid}: {errno}")]
    Kill {
        pid: Pid,
        signal: Signal,
        errno: Errno,
    },
    #[error("couldn't wait for process {pid}: {errno}")]
    Wait { pid: Pid, errno: Errno },
    #[error("couldn't exec '{program}': {errno}")]
    Exec { program: String, errno: Errno },
    #[error("couldn't start a new session: {0}")]
    Session(Errno),
    #[error("couldn't switch user id to {uid}: {errno}")]
    SwitchUser { uid: u32, errno: Errno },
    #[error("couldn't switch group id to {gid}: {errno}")]
    SwitchGroup { gid: u32, errno: Errno },
    #[error("directory lookup for '{name}' failed: {errno}")]
    Lookup { name: String, errno: Errno },
    #[error("access check on '{path}' failed: {errno}")]
    Access { path: String, errno: Errno },
    #[error("couldn't redirect standard streams: {0}")]
    Redirect(#[from] std::io::Error),
    #[error("couldn't duplicate descriptor onto {fd}: {errno}")]
    Dup { fd: i32, errno: Errno },
    #[error("argument contains an interior NUL byte: {0:?}")]
    Nul(String),
    #[error("{0} is not a valid signal number")]
    InvalidSignal(i32),
}

impl Error {
    /// The platform error code behind this error, if it came from a system call.
    #[must_use]
    pub const fn errno(&self) -> Option<Errno> {
        match self {
            Self::Fork(errno)
            | Self::Session(errno)
            | Self::Kill { errno, .. }
            | Self::Wait { errno, .. }
            | Self::Exec { errno, .. }
            | Self::SwitchUser { errno, .. }
            | Self::SwitchGroup { errno, .. }
            | Self::Lookup { errno, .. }
            | Self::Access { errno, .. }
            | Self::Dup { errno, .. } => Some(*errno),
            Self::Redirect(_) | Self::Nul(_) | Self::InvalidSignal(_) => None,
        }
    }
}

/// Converts a raw signal number into a [`Signal`].
///
/// # Errors
///
/// * If `signo` doesn't name a signal on this platform
pub fn signal_from_number(signo: i32) -> Result<Signal, Error> {
    Signal::try_from(signo).map_err(|_| Error::InvalidSignal(signo))
}
