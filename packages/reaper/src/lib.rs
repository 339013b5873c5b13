#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! # Reaper
//!
//! Runs one program under supervision: forks it, optionally as another user, forwards
//! termination signals to it and reports how it ended, either in the foreground or detached
//! as a daemon with a pid file.
//!
//! The building blocks are re-exported:
//!
//! *   [`posix`]: process control, identity lookups and privilege transitions
//! *   [`event_loop`]: the single-threaded loop that reaps tracked children
//! *   [`child`]: the `ChildWatcher` that ties a child to its completion handler

pub use reaper_child as child;
pub use reaper_event_loop as event_loop;
pub use reaper_posix as posix;

pub mod daemon;
pub mod pidfile;
pub mod supervise;
