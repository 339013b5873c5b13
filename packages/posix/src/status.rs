//! Termination status decoding.

use nix::{
    sys::{signal::Signal, wait::WaitStatus},
    unistd::Pid,
};

/// How a child process ended.
///
/// Exactly one of `code` and `signal` is set for a normal exit or a signal death. A status that
/// describes neither (stopped, continued, still alive) decodes to both being `None`, meaning
/// "no information".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Termination {
    pub code: Option<i32>,
    pub signal: Option<Signal>,
}

impl Termination {
    #[must_use]
    pub const fn exited(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    #[must_use]
    pub const fn signaled(signal: Signal) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    #[must_use]
    pub const fn from_wait_status(status: &WaitStatus) -> Self {
        match status {
            WaitStatus::Exited(_, code) => Self::exited(*code),
            WaitStatus::Signaled(_, signal, _) => Self::signaled(*signal),
            _ => Self {
                code: None,
                signal: None,
            },
        }
    }

    /// Decodes a raw `wait(2)` status word.
    #[must_use]
    pub fn from_raw(status: i32) -> Self {
        WaitStatus::from_raw(Pid::from_raw(0), status)
            .map_or_else(|_| Self::default(), |x| Self::from_wait_status(&x))
    }

    /// Platform-independent signal name, e.g. `"SIGTERM"`.
    #[must_use]
    pub fn signal_name(&self) -> Option<&'static str> {
        self.signal.map(Signal::as_str)
    }

    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Shell-style exit code: the exit code itself, or `128 + signo` for a signal death.
    #[must_use]
    pub const fn shell_code(&self) -> Option<i32> {
        match (self.code, self.signal) {
            (Some(code), _) => Some(code),
            (None, Some(signal)) => Some(128 + signal as i32),
            (None, None) => None,
        }
    }
}

impl std::fmt::Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exited with code {code}"),
            (None, Some(signal)) => write!(f, "terminated by {}", signal.as_str()),
            (None, None) => f.write_str("ended without status"),
        }
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test_log::test]
    fn normal_exit_decodes_to_code_only() {
        // exit(7): status word is code << 8
        let termination = Termination::from_raw(7 << 8);
        assert_eq!(termination, Termination::exited(7));
        assert_eq!(termination.signal_name(), None);
    }

    #[test_log::test]
    fn signal_death_decodes_to_signal_only() {
        let termination = Termination::from_raw(Signal::SIGTERM as i32);
        assert_eq!(termination.code, None);
        assert_eq!(termination.signal_name(), Some("SIGTERM"));
    }

    #[test_log::test]
    fn stopped_status_carries_no_information() {
        let termination = Termination::from_wait_status(&WaitStatus::Stopped(
            Pid::from_raw(10),
            Signal::SIGSTOP,
        ));
        assert_eq!(termination, Termination::default());
        assert_eq!(termination.shell_code(), None);
    }

    #[test_log::test]
    fn shell_code_adds_128_to_signal_number() {
        assert_eq!(Termination::signaled(Signal::SIGKILL).shell_code(), Some(137));
        assert_eq!(Termination::exited(3).shell_code(), Some(3));
    }

    #[test_log::test]
    fn display_describes_the_outcome() {
        assert_eq!(Termination::exited(0).to_string(), "exited with code 0");
        assert_eq!(
            Termination::signaled(Signal::SIGINT).to_string(),
            "terminated by SIGINT"
        );
    }
}
