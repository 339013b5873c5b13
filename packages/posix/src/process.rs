//! Process-control primitives: fork, signals, exec, sessions and standard streams.

use std::{
    convert::Infallible,
    ffi::CString,
    fs::OpenOptions,
    os::fd::AsRawFd as _,
    path::Path,
};

use nix::{
    errno::Errno,
    sys::{
        signal::{self, Signal},
        stat::{self, Mode},
        wait::{WaitStatus, waitpid},
    },
    unistd::{self, ForkResult, Pid},
};

pub use nix::unistd::AccessFlags;

use crate::{Error, Termination};

const DEV_NULL: &str = "/dev/null";

/// Status a forked child exits with when it couldn't exec its program.
pub const EXEC_FAILED: i32 = 127;

/// Which side of a `fork` the caller is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forked {
    Parent(Pid),
    Child,
}

impl Forked {
    #[must_use]
    pub const fn is_child(&self) -> bool {
        matches!(self, Self::Child)
    }

    #[must_use]
    pub const fn child_pid(&self) -> Option<Pid> {
        match self {
            Self::Parent(pid) => Some(*pid),
            Self::Child => None,
        }
    }
}

/// Forks the calling process.
///
/// In a multi-threaded parent only the calling thread exists in the child, so the child side
/// should stick to async-signal-safe work until it calls [`exec`] or [`exit_immediately`].
///
/// # Errors
///
/// * If the kernel couldn't create the process
pub fn fork() -> Result<Forked, Error> {
    // SAFETY: the child branch returns straight to the caller without touching shared state;
    // what the caller does next is governed by the contract documented above.
    match unsafe { unistd::fork() } {
        Ok(ForkResult::Parent { child }) => {
            log::debug!("fork: spawned pid={child}");
            Ok(Forked::Parent(child))
        }
        Ok(ForkResult::Child) => Ok(Forked::Child),
        Err(errno) => {
            log::error!("fork: failed: {errno}");
            Err(Error::Fork(errno))
        }
    }
}

/// Sends `signal` to `pid`.
///
/// # Errors
///
/// * If the process doesn't exist (`ESRCH`) or may not be signaled (`EPERM`)
pub fn kill(pid: Pid, signal: Signal) -> Result<(), Error> {
    log::trace!("kill: pid={pid} signal={signal}");
    signal::kill(pid, signal).map_err(|errno| Error::Kill { pid, signal, errno })
}

/// Whether `pid` names an existing process, including one owned by another user.
#[must_use]
pub fn is_alive(pid: Pid) -> bool {
    !matches!(signal::kill(pid, None), Err(Errno::ESRCH))
}

/// Blocks until `pid` exits or is killed and reaps it.
///
/// # Errors
///
/// * If `pid` isn't a child of the calling process
pub fn wait(pid: Pid) -> Result<Termination, Error> {
    loop {
        match waitpid(pid, None) {
            Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                return Ok(Termination::from_wait_status(&status));
            }
            Ok(_) | Err(Errno::EINTR) => {}
            Err(errno) => return Err(Error::Wait { pid, errno }),
        }
    }
}

fn c_string(value: &str) -> Result<CString, Error> {
    CString::new(value).map_err(|_| Error::Nul(value.to_string()))
}

/// Replaces the current process image, searching `PATH` for `program`.
///
/// `args` is the complete argument vector, so `args[0]` is conventionally the program name.
///
/// # Errors
///
/// * If an argument contains a NUL byte
/// * If the kernel refused to load the program
pub fn exec<S: AsRef<str>>(program: &str, args: &[S]) -> Result<Infallible, Error> {
    let file = c_string(program)?;
    let argv = args
        .iter()
        .map(|x| c_string(x.as_ref()))
        .collect::<Result<Vec<_>, _>>()?;

    unistd::execvp(&file, &argv).map_err(|errno| Error::Exec {
        program: program.to_string(),
        errno,
    })
}

/// Terminates the calling process at once, without running exit handlers or destructors.
pub fn exit_immediately(code: i32) -> ! {
    // SAFETY: `_exit` is async-signal-safe and never returns.
    unsafe { libc::_exit(code) }
}

/// Starts a new session with the caller as its leader, detaching it from its controlling
/// terminal.
///
/// # Errors
///
/// * If the caller already leads a process group
pub fn set_session_leader() -> Result<Pid, Error> {
    unistd::setsid().map_err(Error::Session)
}

/// Sets the file mode creation mask, returning the previous one.
pub fn set_umask(mask: u32) -> u32 {
    #[allow(clippy::cast_possible_truncation)]
    let previous = stat::umask(Mode::from_bits_truncate(mask as libc::mode_t));
    u32::from(previous.bits())
}

fn duplicate_onto(file: &std::fs::File, fd: i32) -> Result<(), Error> {
    unistd::dup2(file.as_raw_fd(), fd)
        .map(|_| ())
        .map_err(|errno| Error::Dup { fd, errno })
}

/// Reads standard input from `/dev/null` and appends standard output and error to `log_path`.
///
/// # Errors
///
/// * If `/dev/null` or `log_path` couldn't be opened
/// * If a descriptor couldn't be duplicated over a standard stream
pub fn redirect_stdio(log_path: &Path) -> Result<(), Error> {
    let null = OpenOptions::new().read(true).open(DEV_NULL)?;
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;

    duplicate_onto(&null, libc::STDIN_FILENO)?;
    duplicate_onto(&log, libc::STDOUT_FILENO)?;
    duplicate_onto(&log, libc::STDERR_FILENO)?;

    Ok(())
}

/// Checks whether the real user may access `path` with `mode`.
///
/// # Errors
///
/// * If access is denied or `path` doesn't exist
pub fn check_access(path: &Path, mode: AccessFlags) -> Result<(), Error> {
    unistd::access(path, mode).map_err(|errno| Error::Access {
        path: path.display().to_string(),
        errno,
    })
}

#[must_use]
pub fn is_writable(path: &Path) -> bool {
    check_access(path, AccessFlags::W_OK).is_ok()
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use serial_test::serial;

    use super::*;

    fn wait_for(pid: Pid) -> Termination {
        wait(pid).unwrap()
    }

    #[test_log::test]
    #[serial]
    fn fork_child_exit_code_is_observed_by_parent() {
        match fork().unwrap() {
            Forked::Child => exit_immediately(7),
            Forked::Parent(pid) => assert_eq!(wait_for(pid), Termination::exited(7)),
        }
    }

    #[test_log::test]
    #[serial]
    fn kill_terminates_child() {
        match fork().unwrap() {
            Forked::Child => loop {
                unistd::pause();
            },
            Forked::Parent(pid) => {
                kill(pid, Signal::SIGTERM).unwrap();
                assert_eq!(wait_for(pid), Termination::signaled(Signal::SIGTERM));
                assert!(!is_alive(pid));
            }
        }
    }

    #[test_log::test]
    #[serial]
    fn kill_reaped_process_reports_errno() {
        let Forked::Parent(pid) = fork().unwrap() else {
            exit_immediately(0);
        };
        wait_for(pid);

        let error = kill(pid, Signal::SIGTERM).unwrap_err();
        assert_eq!(error.errno(), Some(Errno::ESRCH));
    }

    #[test_log::test]
    fn init_process_is_alive_even_without_permission_to_signal_it() {
        // kill(1, 0) succeeds for root and fails with EPERM for everyone else
        assert!(is_alive(Pid::from_raw(1)));
    }

    #[test_log::test]
    #[serial]
    fn exec_failure_is_reported_in_child() {
        match fork().unwrap() {
            Forked::Child => {
                let _ = exec("/nonexistent/reaper-test-binary", &["reaper-test-binary"]);
                exit_immediately(EXEC_FAILED)
            }
            Forked::Parent(pid) => assert_eq!(wait_for(pid), Termination::exited(EXEC_FAILED)),
        }
    }

    #[test_log::test]
    #[serial]
    fn wait_on_reaped_process_reports_echild() {
        let Forked::Parent(pid) = fork().unwrap() else {
            exit_immediately(0);
        };
        assert_eq!(wait(pid).unwrap(), Termination::exited(0));
        assert_eq!(wait(pid).unwrap_err().errno(), Some(Errno::ECHILD));
    }

    #[test_log::test]
    fn exec_rejects_interior_nul() {
        let error = exec("sh", &["sh", "-c\0"]).unwrap_err();
        assert!(matches!(error, Error::Nul(_)));
    }

    #[test_log::test]
    #[serial]
    fn redirect_stdio_appends_output_to_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("child.log");
        std::fs::write(&log_path, "before\n").unwrap();

        match fork().unwrap() {
            Forked::Child => {
                if redirect_stdio(&log_path).is_err() {
                    exit_immediately(2);
                }
                let written = unistd::write(std::io::stdout(), b"after\n").is_ok();
                exit_immediately(i32::from(!written));
            }
            Forked::Parent(pid) => {
                assert_eq!(wait_for(pid), Termination::exited(0));
                assert_eq!(std::fs::read_to_string(&log_path).unwrap(), "before\nafter\n");
            }
        }
    }

    #[test_log::test]
    fn check_access_reports_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");

        let error = check_access(&missing, AccessFlags::F_OK).unwrap_err();
        assert_eq!(error.errno(), Some(Errno::ENOENT));
        assert!(check_access(dir.path(), AccessFlags::F_OK).is_ok());
    }

    #[test_log::test]
    fn temp_dir_is_writable() {
        let dir = tempfile::tempdir().unwrap();
        assert!(is_writable(dir.path()));
        assert!(!is_writable(&dir.path().join("missing")));
    }

    #[test_log::test]
    fn forked_helpers() {
        assert_eq!(Forked::Parent(Pid::from_raw(5)).child_pid(), Some(Pid::from_raw(5)));
        assert!(Forked::Child.is_child());
        assert_eq!(Forked::Child.child_pid(), None);
    }
}
