//! SIGCHLD self-pipe.
//!
//! The SIGCHLD handler is installed once per process and writes a byte into the pipe of every
//! live loop, so a loop blocked in `poll` wakes up as soon as any child changes state. Pipes
//! are registered in a fixed table of atomics because the handler may neither lock nor
//! allocate.

use std::{
    ffi::c_int,
    os::fd::{AsFd as _, AsRawFd as _, OwnedFd, RawFd},
    sync::{
        Once,
        atomic::{AtomicI32, Ordering},
    },
    time::Duration,
};

use nix::{
    errno::Errno,
    fcntl::{FcntlArg, FdFlag, OFlag, fcntl},
    poll::{PollFd, PollFlags, PollTimeout, poll},
    sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction},
    unistd,
};

use crate::Error;

pub(crate) const MAX_LOOPS: usize = 32;

const EMPTY: RawFd = -1;

static WAKE_FDS: [AtomicI32; MAX_LOOPS] = [const { AtomicI32::new(EMPTY) }; MAX_LOOPS];

static INSTALL: Once = Once::new();

extern "C" fn on_sigchld(_: c_int) {
    let saved = Errno::last_raw();
    for slot in &WAKE_FDS {
        let fd = slot.load(Ordering::Acquire);
        if fd != EMPTY {
            // SAFETY: write(2) is async-signal-safe; a full pipe already guarantees a wakeup.
            unsafe { libc::write(fd, [1_u8].as_ptr().cast(), 1) };
        }
    }
    Errno::set_raw(saved);
}

fn install_handler() -> Result<(), Error> {
    let mut result = Ok(());
    INSTALL.call_once(|| {
        let action = SigAction::new(
            SigHandler::Handler(on_sigchld),
            SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
            SigSet::empty(),
        );
        // SAFETY: the handler only touches atomics and calls write(2).
        result = unsafe { sigaction(Signal::SIGCHLD, &action) }
            .map(|_| log::debug!("install_handler: SIGCHLD handler installed"))
            .map_err(Error::Wakeup);
    });
    result
}

fn configure(fd: &OwnedFd) -> Result<(), Error> {
    let raw = fd.as_raw_fd();
    let flags = OFlag::from_bits_truncate(fcntl(raw, FcntlArg::F_GETFL).map_err(Error::Wakeup)?);
    fcntl(raw, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK)).map_err(Error::Wakeup)?;
    fcntl(raw, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(Error::Wakeup)?;
    Ok(())
}

fn open_pipe() -> Result<(OwnedFd, OwnedFd), Error> {
    let (read, write) = unistd::pipe().map_err(Error::Wakeup)?;
    configure(&read)?;
    configure(&write)?;
    Ok((read, write))
}

#[derive(Debug)]
pub(crate) struct Wakeup {
    slot: usize,
    read: OwnedFd,
    write: OwnedFd,
}

impl Wakeup {
    pub(crate) fn new() -> Result<Self, Error> {
        install_handler()?;
        let (read, write) = open_pipe()?;
        let raw = write.as_raw_fd();

        let slot = WAKE_FDS
            .iter()
            .position(|slot| {
                slot.compare_exchange(EMPTY, raw, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            })
            .ok_or(Error::TooManyLoops(MAX_LOOPS))?;

        Ok(Self { slot, read, write })
    }

    /// Replaces the pipe with a fresh one. A forked child shares its parent's pipe until this
    /// runs, so either process could swallow the other's wakeups.
    pub(crate) fn renew(&mut self) -> Result<(), Error> {
        let (read, write) = open_pipe()?;
        WAKE_FDS[self.slot].store(write.as_raw_fd(), Ordering::Release);
        self.read = read;
        self.write = write;
        Ok(())
    }

    pub(crate) fn drain(&self) {
        let mut buf = [0_u8; 64];
        loop {
            match unistd::read(self.read.as_raw_fd(), &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    }

    /// Blocks until SIGCHLD arrives or `timeout` elapses. Returns whether a wakeup is pending.
    pub(crate) fn wait(&self, timeout: Duration) -> Result<bool, Error> {
        let mut fds = [PollFd::new(self.read.as_fd(), PollFlags::POLLIN)];
        let timeout = PollTimeout::try_from(timeout).unwrap_or(PollTimeout::MAX);

        match poll(&mut fds, timeout) {
            Ok(ready) => Ok(ready > 0),
            Err(Errno::EINTR) => Ok(true),
            Err(errno) => Err(Error::Wakeup(errno)),
        }
    }
}

impl Drop for Wakeup {
    fn drop(&mut self) {
        let _ = WAKE_FDS[self.slot].compare_exchange(
            self.write.as_raw_fd(),
            EMPTY,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}
