#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! # `reaper_event_loop`
//!
//! A single-threaded event loop that tells registered callers when a child process they track
//! has exited or been killed.
//!
//! Every registration (a watched child or a pending timer) counts as outstanding work, and
//! [`EventLoop::run`] only returns once none is left, so a child that was spawned and then
//! forgotten about still gets its handler called before the program finishes.
//!
//! State changes are detected with a `SIGCHLD` self-pipe plus a non-blocking `waitpid` for
//! each tracked pid. Only tracked pids are reaped; other children of the process are left
//! alone. A child is reaped only immediately before its handlers run, so no other handler ever
//! sees a child that is already gone while its registration is still pending.
//!
//! Handlers run on the thread that drives the loop, never while the loop's own state is
//! borrowed, so they may freely register, unregister or reset.

use std::{
    cell::RefCell,
    collections::BTreeMap,
    rc::{Rc, Weak},
    time::{Duration, Instant},
};

use nix::{
    errno::Errno,
    sys::wait::{WaitPidFlag, waitpid},
};
use reaper_logging::debug_or_trace;
use reaper_posix::Pid;
use thiserror::Error;

pub use nix::sys::wait::WaitStatus;

mod wakeup;

use wakeup::Wakeup;

/// Error returned by a handler. It stops the loop and is handed back to whoever drives it.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub type HandlerResult = Result<(), HandlerError>;

type ChildHandler = Box<dyn FnOnce(Option<WaitStatus>) -> HandlerResult>;
type TimerHandler = Box<dyn FnOnce() -> HandlerResult>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("couldn't set up the SIGCHLD wakeup: {0}")]
    Wakeup(Errno),
    #[error("no free wakeup slot, at most {0} event loops may exist at once")]
    TooManyLoops(usize),
    #[error("couldn't wait for process {pid}: {errno}")]
    Wait { pid: Pid, errno: Errno },
    #[error("handler failed: {0}")]
    Handler(HandlerError),
}

/// Identifies one child registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChildToken {
    id: u64,
    pid: Pid,
}

impl ChildToken {
    #[must_use]
    pub const fn pid(&self) -> Pid {
        self.pid
    }
}

/// Identifies one pending timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerToken {
    id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopConfig {
    reap_interval: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopConfig {
    /// How long a blocked loop waits before re-checking its children when no `SIGCHLD` woke it.
    pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(1);

    #[must_use]
    pub const fn new() -> Self {
        Self {
            reap_interval: Self::DEFAULT_REAP_INTERVAL,
        }
    }

    pub const fn reap_interval(&mut self, reap_interval: Duration) -> &mut Self {
        self.reap_interval = reap_interval;
        self
    }

    #[must_use]
    pub const fn get_reap_interval(&self) -> Duration {
        self.reap_interval
    }

    /// # Errors
    ///
    /// * If the `SIGCHLD` handler or the wakeup pipe couldn't be set up
    /// * If too many loops already exist in this process
    pub fn build(&self) -> Result<EventLoop, Error> {
        Ok(EventLoop {
            inner: Rc::new(RefCell::new(Inner {
                config: *self,
                next_id: 0,
                children: BTreeMap::new(),
                timers: BTreeMap::new(),
                wakeup: Wakeup::new()?,
            })),
        })
    }
}

struct ChildRegistration {
    pid: Pid,
    handler: ChildHandler,
}

struct TimerRegistration {
    deadline: Instant,
    handler: TimerHandler,
}

struct Inner {
    config: LoopConfig,
    next_id: u64,
    children: BTreeMap<u64, ChildRegistration>,
    timers: BTreeMap<u64, TimerRegistration>,
    wakeup: Wakeup,
}

impl Inner {
    const fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Handle to an event loop. Clones share the same loop.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<RefCell<Inner>>,
}

/// Non-owning handle to an event loop, for registrations that need to reach back into the loop
/// that holds them.
#[derive(Debug, Clone)]
pub struct WeakEventLoop {
    inner: Weak<RefCell<Inner>>,
}

impl WeakEventLoop {
    #[must_use]
    pub fn upgrade(&self) -> Option<EventLoop> {
        self.inner.upgrade().map(|inner| EventLoop { inner })
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("EventLoop")
            .field("config", &inner.config)
            .field("children", &inner.children.len())
            .field("timers", &inner.timers.len())
            .finish_non_exhaustive()
    }
}

impl EventLoop {
    /// Builds a loop with the default [`LoopConfig`].
    ///
    /// # Errors
    ///
    /// * If the `SIGCHLD` handler or the wakeup pipe couldn't be set up
    /// * If too many loops already exist in this process
    pub fn new() -> Result<Self, Error> {
        LoopConfig::new().build()
    }

    #[must_use]
    pub fn downgrade(&self) -> WeakEventLoop {
        WeakEventLoop {
            inner: Rc::downgrade(&self.inner),
        }
    }

    #[must_use]
    pub fn config(&self) -> LoopConfig {
        self.inner.borrow().config
    }

    /// Calls `handler` once, with the wait status, when `pid` exits or is killed.
    ///
    /// The handler gets `None` when the status can't be known because `pid` is not (or no
    /// longer) a child of this process, e.g. it was reaped by someone else. The registration is
    /// removed before the handler runs.
    pub fn watch_child(
        &self,
        pid: Pid,
        handler: impl FnOnce(Option<WaitStatus>) -> HandlerResult + 'static,
    ) -> ChildToken {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id();
        inner.children.insert(
            id,
            ChildRegistration {
                pid,
                handler: Box::new(handler),
            },
        );
        log::trace!("watch_child: pid={pid} token={id}");
        ChildToken { id, pid }
    }

    /// Drops a child registration without calling its handler. Returns whether it was still
    /// registered.
    pub fn unwatch_child(&self, token: ChildToken) -> bool {
        let removed = self.inner.borrow_mut().children.remove(&token.id);
        log::trace!(
            "unwatch_child: pid={} token={} removed={}",
            token.pid,
            token.id,
            removed.is_some()
        );
        removed.is_some()
    }

    #[must_use]
    pub fn is_watching(&self, token: ChildToken) -> bool {
        self.inner.borrow().children.contains_key(&token.id)
    }

    /// Calls `handler` once after `after` has elapsed.
    pub fn add_timer(
        &self,
        after: Duration,
        handler: impl FnOnce() -> HandlerResult + 'static,
    ) -> TimerToken {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id();
        inner.timers.insert(
            id,
            TimerRegistration {
                deadline: Instant::now() + after,
                handler: Box::new(handler),
            },
        );
        log::trace!("add_timer: after={after:?} token={id}");
        TimerToken { id }
    }

    pub fn cancel_timer(&self, token: TimerToken) -> bool {
        let removed = self.inner.borrow_mut().timers.remove(&token.id);
        removed.is_some()
    }

    /// Number of registrations keeping the loop alive.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        let inner = self.inner.borrow();
        inner.children.len() + inner.timers.len()
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.outstanding() > 0
    }

    /// Runs until no registration is outstanding.
    ///
    /// # Errors
    ///
    /// * If a handler fails; the loop stops and can be resumed by calling `run` again
    /// * If waiting on a tracked child or the wakeup pipe fails
    pub fn run(&self) -> Result<(), Error> {
        log::debug!("run: starting outstanding={}", self.outstanding());

        while self.is_alive() {
            self.run_once(true)?;
        }

        log::debug!("run: nothing left to do");
        Ok(())
    }

    /// Dispatches every handler that is ready. When nothing is ready and `block` is set, waits
    /// for `SIGCHLD`, the next timer or the reap interval, whichever comes first, and tries
    /// once more. Returns the number of handlers called.
    ///
    /// # Errors
    ///
    /// * If a handler fails; the other handlers of the same child still run, and children
    ///   and timers not yet looked at are left for the next call
    /// * If waiting on a tracked child or the wakeup pipe fails
    pub fn run_once(&self, block: bool) -> Result<usize, Error> {
        let dispatched = self.dispatch_ready()?;
        if dispatched > 0 || !block || !self.is_alive() {
            return Ok(dispatched);
        }

        let timeout = self.next_timeout();
        log::trace!("run_once: waiting timeout={timeout:?}");
        self.inner.borrow().wakeup.wait(timeout)?;

        self.dispatch_ready()
    }

    /// Makes the loop usable in a freshly forked child, which otherwise shares its parent's
    /// wakeup pipe. Inherited registrations are kept.
    ///
    /// # Errors
    ///
    /// * If a new wakeup pipe couldn't be created
    pub fn after_fork(&self) -> Result<(), Error> {
        self.inner.borrow_mut().wakeup.renew()
    }

    /// Discards every registration and timer without calling their handlers, leaving an empty
    /// loop with its own wakeup pipe. Meant for a forked child that must not inherit its
    /// parent's pending work.
    ///
    /// # Errors
    ///
    /// * If a new wakeup pipe couldn't be created
    pub fn reset(&self) -> Result<(), Error> {
        let (children, timers) = {
            let mut inner = self.inner.borrow_mut();
            inner.wakeup.renew()?;
            (
                std::mem::take(&mut inner.children),
                std::mem::take(&mut inner.timers),
            )
        };

        log::debug!(
            "reset: discarded children={} timers={}",
            children.len(),
            timers.len()
        );

        // handlers may own handles to this loop, so they are dropped without the borrow held
        drop(children);
        drop(timers);

        Ok(())
    }

    fn next_timeout(&self) -> Duration {
        let inner = self.inner.borrow();
        let now = Instant::now();
        inner
            .timers
            .values()
            .map(|x| x.deadline.saturating_duration_since(now))
            .min()
            .map_or(inner.config.reap_interval, |x| {
                x.min(inner.config.reap_interval)
            })
    }

    fn dispatch_ready(&self) -> Result<usize, Error> {
        self.inner.borrow().wakeup.drain();

        let pending = self
            .inner
            .borrow()
            .children
            .iter()
            .map(|(id, x)| (*id, x.pid))
            .collect::<Vec<_>>();

        let mut dispatched = 0;
        for (id, pid) in pending {
            // unwatched by an earlier handler, or delivered along with an earlier
            // registration for the same pid
            if !self.inner.borrow().children.contains_key(&id) {
                continue;
            }

            let result = loop {
                match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                    Err(Errno::EINTR) => {}
                    other => break other,
                }
            };

            let status = match result {
                Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                    log::trace!("reap: pid={pid} status={status:?}");
                    Some(status)
                }
                Ok(_) => continue,
                Err(Errno::ECHILD) => {
                    log::warn!(
                        "reap: pid={pid} is not a child of this process, its status is lost token={id}"
                    );
                    None
                }
                Err(errno) => return Err(Error::Wait { pid, errno }),
            };

            dispatched += self.dispatch_child(pid, status)?;
        }

        for id in self.expired_timers() {
            if self.dispatch_timer(id)? {
                dispatched += 1;
            }
        }

        Ok(dispatched)
    }

    /// Removes every registration for `pid` and calls their handlers. All of them run even if
    /// one fails; the first failure is returned.
    fn dispatch_child(&self, pid: Pid, status: Option<WaitStatus>) -> Result<usize, Error> {
        let registrations = {
            let mut inner = self.inner.borrow_mut();
            let ids = inner
                .children
                .iter()
                .filter(|(_, x)| x.pid == pid)
                .map(|(id, _)| *id)
                .collect::<Vec<_>>();
            ids.into_iter()
                .filter_map(|id| inner.children.remove(&id).map(|x| (id, x)))
                .collect::<Vec<_>>()
        };

        let mut result = Ok(registrations.len());
        for (id, registration) in registrations {
            debug_or_trace!(
                ("dispatch: child pid={pid}"),
                ("dispatch: child pid={pid} token={id} status={status:?}")
            );
            let outcome = (registration.handler)(status);
            result = result.and_then(|count| outcome.map(|()| count).map_err(Error::Handler));
        }

        result
    }

    fn expired_timers(&self) -> Vec<u64> {
        let inner = self.inner.borrow();
        let now = Instant::now();

        let mut timers = inner
            .timers
            .iter()
            .filter(|(_, x)| x.deadline <= now)
            .map(|(id, x)| (x.deadline, *id))
            .collect::<Vec<_>>();
        timers.sort_unstable();

        timers.into_iter().map(|(_, id)| id).collect()
    }

    /// Removes an expired timer and calls its handler. Returns `false` if an earlier handler
    /// already cancelled it.
    fn dispatch_timer(&self, id: u64) -> Result<bool, Error> {
        let registration = self.inner.borrow_mut().timers.remove(&id);
        let Some(TimerRegistration { handler, .. }) = registration else {
            return Ok(false);
        };

        log::trace!("dispatch: timer token={id}");
        handler().map_err(Error::Handler)?;

        Ok(true)
    }
}
