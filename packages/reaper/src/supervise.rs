//! Running one program under supervision.

use std::{
    cell::Cell,
    rc::Rc,
    sync::atomic::{AtomicBool, AtomicI32, Ordering},
};

use reaper_child::ChildWatcher;
use reaper_event_loop::EventLoop;
use reaper_posix::{
    Pid, Signal, Termination,
    identity::{lookup_group, lookup_user},
    privilege::{CredentialProvider, Privileges},
    process,
};
use thiserror::Error;

/// The pid signals are forwarded to, or 0 while nothing is supervised.
static FORWARD_TO: AtomicI32 = AtomicI32::new(0);

/// Set while a termination request hasn't reached a supervised process yet.
static TERMINATION_PENDING: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Error)]
pub enum SuperviseError {
    #[error("unknown user '{0}'")]
    UnknownUser(String),
    #[error("unknown group '{0}'")]
    UnknownGroup(String),
    #[error("no program to run")]
    NoProgram,
    #[error("the supervised process ended without a termination status")]
    NoStatus,
    #[error(transparent)]
    Posix(#[from] reaper_posix::Error),
    #[error(transparent)]
    Child(#[from] reaper_child::Error),
    #[error(transparent)]
    EventLoop(#[from] reaper_event_loop::Error),
    #[error(transparent)]
    Signals(#[from] ctrlc::Error),
}

/// The ids a supervised program runs as. `None` keeps the supervisor's own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Credentials {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl Credentials {
    /// Resolves user and group names. Without a group, the user's primary group is used.
    ///
    /// # Errors
    ///
    /// * If a name doesn't exist
    /// * If the user or group database couldn't be read
    pub fn resolve(user: Option<&str>, group: Option<&str>) -> Result<Self, SuperviseError> {
        let user = match user {
            Some(name) => Some(
                lookup_user(name)?.ok_or_else(|| SuperviseError::UnknownUser(name.to_string()))?,
            ),
            None => None,
        };

        let gid = match group {
            Some(name) => Some(
                lookup_group(name)?
                    .ok_or_else(|| SuperviseError::UnknownGroup(name.to_string()))?
                    .gid,
            ),
            None => user.as_ref().map(|x| x.gid),
        };

        Ok(Self {
            uid: user.map(|x| x.uid),
            gid,
        })
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.uid.is_none() && self.gid.is_none()
    }

    /// Switches to the group, then to the user, since dropping the user first would take away
    /// the right to change groups.
    ///
    /// # Errors
    ///
    /// * If either switch was refused
    pub fn apply<P: CredentialProvider>(
        &self,
        privileges: &mut Privileges<P>,
    ) -> Result<(), reaper_posix::Error> {
        if let Some(gid) = self.gid {
            privileges.switch_group_id(gid)?;
        }
        if let Some(uid) = self.uid {
            privileges.switch_user_id(uid)?;
        }
        Ok(())
    }
}

/// Sends `signal` to the supervised process, if there is one. Returns whether it was sent.
pub fn forward(signal: Signal) -> bool {
    let pid = FORWARD_TO.load(Ordering::SeqCst);
    if pid <= 0 {
        return false;
    }

    match process::kill(Pid::from_raw(pid), signal) {
        Ok(()) => {
            log::info!("forward: sent {signal} to pid={pid}");
            true
        }
        Err(e) => {
            log::warn!("forward: {e}");
            false
        }
    }
}

/// Forwards `SIGINT`, `SIGTERM` and `SIGHUP` received by this process to the supervised
/// process as `SIGTERM`. Installs a process-wide handler, so it can only be called once.
///
/// # Errors
///
/// * If the handler was already installed or couldn't be installed
pub fn forward_termination_signals() -> Result<(), SuperviseError> {
    ctrlc::set_handler(|| {
        if !request_termination() {
            log::debug!("forward_termination_signals: nothing to forward to yet");
        }
    })?;
    Ok(())
}

/// Sends `SIGTERM` to the supervised process. A request made while nothing runs, including
/// between fork and the pid being published, is delivered by the next [`Supervisor::spawn`].
/// Returns whether it was sent now.
pub fn request_termination() -> bool {
    TERMINATION_PENDING.store(true, Ordering::SeqCst);
    let sent = forward(Signal::SIGTERM);
    if sent {
        TERMINATION_PENDING.store(false, Ordering::SeqCst);
    }
    sent
}

/// Runs a program and waits for it on its own event loop.
#[derive(Debug)]
pub struct Supervisor {
    event_loop: EventLoop,
    watcher: ChildWatcher,
    outcome: Rc<Cell<Option<Termination>>>,
}

impl Supervisor {
    /// # Errors
    ///
    /// * If the event loop couldn't be created
    pub fn new() -> Result<Self, SuperviseError> {
        Ok(Self::with_loop(EventLoop::new()?))
    }

    #[must_use]
    pub fn with_loop(event_loop: EventLoop) -> Self {
        let outcome = Rc::new(Cell::new(None));
        let sink = outcome.clone();
        let watcher = ChildWatcher::new(&event_loop, move |termination| {
            FORWARD_TO.store(0, Ordering::SeqCst);
            log::info!("supervised process {termination}");
            sink.set(Some(termination));
            Ok(())
        });

        Self {
            event_loop,
            watcher,
            outcome,
        }
    }

    /// Starts `command[0]` with `command` as its argument vector, as `credentials`.
    ///
    /// # Errors
    ///
    /// * [`SuperviseError::NoProgram`] if `command` is empty
    /// * If a program is already running or the fork failed
    pub fn spawn<S: AsRef<str>>(
        &self,
        command: &[S],
        credentials: Credentials,
    ) -> Result<Pid, SuperviseError> {
        let Some(program) = command.first().map(AsRef::as_ref) else {
            return Err(SuperviseError::NoProgram);
        };

        let pid = self.watcher.spawn(program, command, || {
            if credentials.is_empty() {
                return Ok(());
            }
            credentials.apply(&mut Privileges::new())
        })?;

        FORWARD_TO.store(pid.as_raw(), Ordering::SeqCst);
        log::info!("spawn: program={program} pid={pid} {credentials:?}");

        if TERMINATION_PENDING.swap(false, Ordering::SeqCst) {
            log::info!("spawn: termination was requested before pid={pid} started");
            forward(Signal::SIGTERM);
        }

        Ok(pid)
    }

    #[must_use]
    pub fn pid(&self) -> Option<Pid> {
        self.watcher.pid()
    }

    /// Runs the event loop until the program has ended.
    ///
    /// # Errors
    ///
    /// * If the event loop failed
    /// * [`SuperviseError::NoStatus`] if nothing was spawned
    pub fn wait(&self) -> Result<Termination, SuperviseError> {
        self.event_loop.run()?;
        self.outcome.take().ok_or(SuperviseError::NoStatus)
    }
}
