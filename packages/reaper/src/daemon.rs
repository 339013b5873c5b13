//! Detaching from the controlling terminal.
//!
//! [`daemonize`] forks twice. The intermediate process starts a new session and exits right
//! after the second fork, so the daemon is neither a session leader nor a child of the
//! original process, and can never reacquire a terminal. The original process waits on a
//! pipe until the daemon reports it is [`Ready`], or until the pipe closes because the daemon
//! died first.

use std::{
    fs::File,
    io::{ErrorKind, Read as _, Write as _},
    os::fd::OwnedFd,
    path::Path,
};

use nix::{errno::Errno, fcntl::OFlag, unistd};
use reaper_posix::process::{self, Forked};
use thiserror::Error;

const READY: u8 = b'R';

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("couldn't create the ready pipe: {0}")]
    Pipe(Errno),
    #[error(transparent)]
    Posix(#[from] reaper_posix::Error),
    #[error(transparent)]
    IO(#[from] std::io::Error),
}

/// Held by the daemon until it is up.
#[derive(Debug)]
pub struct Ready {
    pipe: File,
}

impl Ready {
    /// Lets the original process exit successfully.
    ///
    /// # Errors
    ///
    /// * If the original process is gone
    pub fn notify(mut self) -> Result<(), DaemonError> {
        self.pipe.write_all(&[READY])?;
        log::debug!("notify: daemon ready");
        Ok(())
    }
}

/// Which process [`daemonize`] returned in.
#[derive(Debug)]
pub enum Detached {
    /// The process that called [`daemonize`]. `ready` tells whether the daemon reported
    /// readiness before its end of the pipe closed.
    Original { ready: bool },
    /// The detached daemon.
    Daemon(Ready),
}

fn wait_ready(pipe: OwnedFd) -> bool {
    let mut pipe = File::from(pipe);
    let mut buf = [0_u8; 1];
    loop {
        match pipe.read(&mut buf) {
            Ok(0) => return false,
            Ok(_) => return buf[0] == READY,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                log::error!("wait_ready: {e}");
                return false;
            }
        }
    }
}

/// Runs in the intermediate process; only the daemon returns.
fn detach(log_path: &Path) -> Result<(), DaemonError> {
    process::set_session_leader()?;

    if let Forked::Parent(pid) = process::fork()? {
        log::debug!("detach: daemon pid={pid}");
        process::exit_immediately(0);
    }

    process::set_umask(0);
    process::redirect_stdio(log_path)?;

    Ok(())
}

/// Detaches into a daemon whose standard output and error are appended to `log_path`.
///
/// Returns twice, like `fork`: once in the original process after the daemon reported
/// readiness or died, and once in the daemon. A failure while detaching ends the daemon side
/// with exit status 1, which the original process sees as `ready: false`.
///
/// # Errors
///
/// * If the ready pipe couldn't be created or the first fork failed
pub fn daemonize(log_path: &Path) -> Result<Detached, DaemonError> {
    let (read, write) = unistd::pipe2(OFlag::O_CLOEXEC).map_err(DaemonError::Pipe)?;

    match process::fork()? {
        Forked::Parent(intermediate) => {
            drop(write);
            let termination = process::wait(intermediate)?;
            log::debug!("daemonize: intermediate process {termination}");

            let ready = wait_ready(read);
            log::debug!("daemonize: ready={ready}");

            Ok(Detached::Original { ready })
        }
        Forked::Child => {
            drop(read);
            if let Err(e) = detach(log_path) {
                log::error!("daemonize: {e}");
                process::exit_immediately(1);
            }

            Ok(Detached::Daemon(Ready {
                pipe: File::from(write),
            }))
        }
    }
}

#[cfg(test)]
mod test {
    use std::{fs, io::Write as _};

    use reaper_posix::{identity, process::exit_immediately};
    use serial_test::serial;

    use super::*;

    #[test_log::test]
    #[serial]
    fn original_returns_once_daemon_is_ready() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("daemon.log");

        match daemonize(&log_path).unwrap() {
            Detached::Daemon(ready) => {
                let mut stdout = std::io::stdout();
                let written = writeln!(stdout, "daemon pid={}", identity::get_pid()).is_ok()
                    && stdout.flush().is_ok();
                let detached = nix::unistd::getsid(None).is_ok_and(|sid| {
                    sid.as_raw() != identity::get_pid()
                });
                let notified = ready.notify().is_ok();
                exit_immediately(i32::from(!(written && detached && notified)))
            }
            Detached::Original { ready } => {
                assert!(ready);
                assert!(fs::read_to_string(&log_path).unwrap().contains("daemon pid="));
            }
        }
    }

    #[test_log::test]
    #[serial]
    fn daemon_exiting_without_notifying_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("daemon.log");

        match daemonize(&log_path).unwrap() {
            Detached::Daemon(_ready) => exit_immediately(0),
            Detached::Original { ready } => assert!(!ready),
        }
    }

    #[test_log::test]
    #[serial]
    fn unwritable_log_fails_in_the_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("missing").join("daemon.log");

        match daemonize(&log_path).unwrap() {
            Detached::Daemon(ready) => {
                let _ = ready.notify();
                exit_immediately(0)
            }
            Detached::Original { ready } => assert!(!ready),
        }
    }
}
