#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! # `reaper_child`
//!
//! [`ChildWatcher`] forks one child process at a time and calls its completion handler exactly
//! once when that child exits or is killed.
//!
//! While a child is tracked, the watcher is registered with its [`EventLoop`], and the
//! registration owns a strong reference to the watcher's state. Dropping every
//! [`ChildWatcher`] handle therefore does not lose the notification: the loop keeps running
//! and the handler still fires.
//!
//! Calling [`ChildWatcher::dispose`], or discarding the registration by dropping the loop or
//! resetting it, stops tracking without calling the handler. The watcher goes idle and the
//! child gets `SIGTERM`, whether or not any [`ChildWatcher`] handle is still alive.
//!
//! ```rust,no_run
//! use reaper_child::ChildWatcher;
//! use reaper_event_loop::EventLoop;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let event_loop = EventLoop::new()?;
//! let watcher = ChildWatcher::new(&event_loop, |termination| {
//!     println!("child {termination}");
//!     Ok(())
//! });
//!
//! watcher.spawn("sleep", &["sleep", "1"], || Ok(()))?;
//! event_loop.run()?;
//! # Ok(())
//! # }
//! ```

use std::{cell::RefCell, rc::Rc};

use reaper_event_loop::{ChildToken, EventLoop, HandlerResult, WaitStatus, WeakEventLoop};
use reaper_posix::{
    Pid, Signal, Termination, identity,
    process::{self, EXEC_FAILED, Forked},
};
use thiserror::Error;

/// Called with the child's [`Termination`] once per successful fork.
pub type CompletionHandler = Box<dyn FnMut(Termination) -> HandlerResult>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("watcher is already tracking process {pid}")]
    AlreadyActive { pid: Pid },
    #[error("the watcher's event loop no longer exists")]
    LoopClosed,
    #[error(transparent)]
    Posix(#[from] reaper_posix::Error),
    #[error(transparent)]
    EventLoop(#[from] reaper_event_loop::Error),
}

struct WatcherState {
    event_loop: WeakEventLoop,
    pid: Option<Pid>,
    token: Option<ChildToken>,
    /// The process that forked `pid`. A watcher inherited by a forked child must leave its
    /// parent's children alone.
    owner: Option<Pid>,
    handler: Option<CompletionHandler>,
    last_termination: Option<Termination>,
}

fn current_pid() -> Pid {
    Pid::from_raw(identity::get_pid())
}

impl WatcherState {
    /// The tracked pid, if this process is the one that forked it.
    fn owned_pid(&self) -> Option<Pid> {
        self.pid.filter(|_| self.owner == Some(current_pid()))
    }

    /// `None` means the child was reaped elsewhere and its status is unknown.
    fn on_termination(state: &Rc<RefCell<Self>>, status: Option<&WaitStatus>) -> HandlerResult {
        let termination = status.map_or_else(Termination::default, Termination::from_wait_status);

        let (pid, handler) = {
            let mut inner = state.borrow_mut();
            inner.token = None;
            inner.owner = None;
            inner.last_termination = Some(termination);
            (inner.pid.take(), inner.handler.take())
        };

        log::debug!("on_termination: pid={pid:?} {termination}");

        let Some(mut handler) = handler else {
            return Ok(());
        };

        let result = handler(termination);

        let mut inner = state.borrow_mut();
        if inner.handler.is_none() {
            inner.handler = Some(handler);
        }

        result
    }

    fn abandon(state: &Rc<RefCell<Self>>) {
        let pid = {
            let mut inner = state.borrow_mut();
            let pid = inner.owned_pid();
            inner.pid = None;
            inner.owner = None;
            inner.token = None;
            pid
        };

        if let Some(pid) = pid {
            log::debug!("abandon: terminating pid={pid}");
            if let Err(e) = process::kill(pid, Signal::SIGTERM) {
                log::debug!("abandon: {e}");
            }
        }
    }
}

/// Owned by the loop registration. Dropped without being delivered means the registration
/// was discarded.
struct Registration {
    state: Option<Rc<RefCell<WatcherState>>>,
}

impl Registration {
    fn deliver(mut self, status: Option<&WaitStatus>) -> HandlerResult {
        self.state
            .take()
            .map_or(Ok(()), |state| WatcherState::on_termination(&state, status))
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            WatcherState::abandon(&state);
        }
    }
}

/// Tracks one child process at a time on an [`EventLoop`].
pub struct ChildWatcher {
    state: Rc<RefCell<WatcherState>>,
}

impl std::fmt::Debug for ChildWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("ChildWatcher")
            .field("pid", &state.pid)
            .field("token", &state.token)
            .field("last_termination", &state.last_termination)
            .finish_non_exhaustive()
    }
}

impl ChildWatcher {
    #[must_use]
    pub fn new(
        event_loop: &EventLoop,
        handler: impl FnMut(Termination) -> HandlerResult + 'static,
    ) -> Self {
        Self {
            state: Rc::new(RefCell::new(WatcherState {
                event_loop: event_loop.downgrade(),
                pid: None,
                token: None,
                owner: None,
                handler: Some(Box::new(handler)),
                last_termination: None,
            })),
        }
    }

    /// Replaces the completion handler, including from inside the running handler.
    pub fn set_handler(&self, handler: impl FnMut(Termination) -> HandlerResult + 'static) {
        self.state.borrow_mut().handler = Some(Box::new(handler));
    }

    /// The tracked child, or `None` when idle.
    #[must_use]
    pub fn pid(&self) -> Option<Pid> {
        self.state.borrow().pid
    }

    /// Whether a child is being tracked. Stays `true` until its termination is delivered or
    /// the watcher is disposed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.borrow().pid.is_some()
    }

    /// How the most recently tracked child ended.
    #[must_use]
    pub fn last_termination(&self) -> Option<Termination> {
        self.state.borrow().last_termination
    }

    fn event_loop(&self) -> Result<EventLoop, Error> {
        self.state
            .borrow()
            .event_loop
            .upgrade()
            .ok_or(Error::LoopClosed)
    }

    fn ensure_idle(&self) -> Result<EventLoop, Error> {
        if let Some(pid) = self.pid() {
            return Err(Error::AlreadyActive { pid });
        }
        self.event_loop()
    }

    fn track(&self, event_loop: &EventLoop, pid: Pid) {
        let registration = Registration {
            state: Some(self.state.clone()),
        };
        let token = event_loop.watch_child(pid, move |status| {
            registration.deliver(status.as_ref())
        });

        let mut inner = self.state.borrow_mut();
        inner.pid = Some(pid);
        inner.token = Some(token);
        inner.owner = Some(current_pid());
    }

    /// Forks the calling process and, in the parent, starts tracking the child.
    ///
    /// In the child the event loop gets its own wakeup pipe. With `reinit_event_loop` the
    /// child's loop also drops every registration and timer inherited from the parent.
    ///
    /// # Errors
    ///
    /// * [`Error::AlreadyActive`] if a child is already tracked; nothing is changed
    /// * If the event loop is gone or the fork failed
    /// * In the child, if its event loop couldn't be set up again
    pub fn fork(&self, reinit_event_loop: bool) -> Result<Forked, Error> {
        let event_loop = self.ensure_idle()?;

        let forked = process::fork()?;
        match forked {
            Forked::Parent(pid) => {
                log::debug!("fork: tracking pid={pid}");
                self.track(&event_loop, pid);
            }
            Forked::Child => {
                event_loop.after_fork()?;
                if reinit_event_loop {
                    event_loop.reset()?;
                }
            }
        }

        Ok(forked)
    }

    /// Forks and runs `program` in the child, searching `PATH`.
    ///
    /// `prepare` runs in the child before `exec` (dropping privileges, starting a session and
    /// the like). If it fails, or `exec` does, the child exits with status
    /// [`EXEC_FAILED`] without returning here.
    ///
    /// # Errors
    ///
    /// * [`Error::AlreadyActive`] if a child is already tracked
    /// * If the event loop is gone or the fork failed
    pub fn spawn<S: AsRef<str>>(
        &self,
        program: &str,
        args: &[S],
        prepare: impl FnOnce() -> Result<(), reaper_posix::Error>,
    ) -> Result<Pid, Error> {
        let event_loop = self.ensure_idle()?;

        match process::fork()? {
            Forked::Parent(pid) => {
                log::debug!("spawn: program={program} pid={pid}");
                self.track(&event_loop, pid);
                Ok(pid)
            }
            Forked::Child => {
                // only async-signal-safe calls from here on, so the failure isn't logged
                if prepare().is_ok() {
                    let _ = process::exec(program, args);
                }
                process::exit_immediately(EXEC_FAILED)
            }
        }
    }

    /// Sends `signal` (`SIGTERM` by default) to the tracked child.
    ///
    /// Returns `false` without doing anything when no child is tracked. Termination is still
    /// reported through the completion handler, never here.
    ///
    /// # Errors
    ///
    /// * If the kernel refused to deliver the signal
    pub fn kill(&self, signal: Option<Signal>) -> Result<bool, Error> {
        let Some(pid) = self.state.borrow().owned_pid() else {
            return Ok(false);
        };

        process::kill(pid, signal.unwrap_or(Signal::SIGTERM))?;

        Ok(true)
    }

    /// Stops tracking the child and asks it to terminate. The completion handler won't be
    /// called for it. Safe to call any number of times.
    pub fn dispose(&self) {
        let (token, pid) = {
            let mut inner = self.state.borrow_mut();
            let pid = inner.owned_pid();
            inner.pid = None;
            inner.owner = None;
            (inner.token.take(), pid)
        };

        if let Some(token) = token {
            let event_loop = self.state.borrow().event_loop.upgrade();
            if let Some(event_loop) = event_loop {
                event_loop.unwatch_child(token);
            }
        }

        if let Some(pid) = pid {
            log::debug!("dispose: terminating pid={pid}");
            if let Err(e) = process::kill(pid, Signal::SIGTERM) {
                log::debug!("dispose: {e}");
            }
        }
    }
}
