//! The readiness engine: back-end-agnostic contract plus startup selection
//! of the one back-end available on the host platform.
//!
//! Two back-ends are provided, each compiled only where its kernel API
//! exists: [`kqueue::KqueueEngine`] (a plain kernel event queue) on the BSD
//! family, and [`spec::SpecEpollEngine`] (edge-triggered epoll augmented with
//! the speculative I/O optimization) on Linux and Android. Both implement
//! [`Poller`]; callers never see which one they got beyond its name.

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd",
))]
mod kqueue;
#[cfg(any(target_os = "linux", target_os = "android"))]
mod spec;

#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd",
))]
pub use kqueue::KqueueEngine;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use spec::SpecEpollEngine;

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::fd::FdRegistry;
use crate::interest::Direction;
use crate::time::Tick;

/// Shared contract every back-end implements, per the readiness engine's
/// public contract.
pub trait Poller {
    fn name(&self) -> &'static str;

    fn is_set(&self, fd: RawFd, dir: Direction) -> bool;

    /// Register interest in `dir` for `fd`. Returns whether the state
    /// actually changed (a no-op `set` on an already-set direction returns
    /// `false`).
    fn set(&mut self, fd: RawFd, dir: Direction) -> io::Result<bool>;

    /// Clear interest in `dir` for `fd`. Returns whether the state changed.
    fn clear(&mut self, fd: RawFd, dir: Direction) -> io::Result<bool>;

    /// Clear both directions for `fd`.
    fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        let a = self.clear(fd, Direction::Read)?;
        let b = self.clear(fd, Direction::Write)?;
        let _ = (a, b);
        Ok(())
    }

    /// Called from the fd-close path; purges any engine-private state (side
    /// lists, pending changes) referencing `fd`. Must be idempotent.
    fn close_notify(&mut self, fd: RawFd);

    /// Wait until `deadline` (or forever if `None`), dispatching callbacks
    /// through `registry` as events arrive. Does not return a value: all
    /// observable effects happen through dispatched callbacks.
    fn poll(&mut self, registry: &mut FdRegistry, deadline: Option<Tick>, now: Tick)
        -> io::Result<()>;
}

/// Clamp a deadline to a `Duration` for use with a syscall that takes a
/// relative timeout, per the "remaining = deadline - now, clamped" rule in
/// the kernel-wait-decision step.
pub(crate) fn remaining(deadline: Option<Tick>, now: Tick, max: Duration) -> Option<Duration> {
    match deadline {
        None => Some(max),
        Some(d) => {
            let dur = d.saturating_duration_until(now);
            Some(dur.min(max))
        }
    }
}

/// Construct the readiness back-end for the host platform: the speculative
/// epoll engine on Linux/Android, kqueue on the BSD family.
pub fn select_engine(maxsock: usize) -> io::Result<Box<dyn Poller>> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        return SpecEpollEngine::new(maxsock).map(|e| Box::new(e) as Box<dyn Poller>).map_err(|err| {
            #[cfg(feature = "log")]
            log::warn!("speculative epoll backend failed to initialize: {err}");
            err
        });
    }
    #[cfg(any(
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "ios",
        target_os = "macos",
        target_os = "netbsd",
        target_os = "openbsd",
    ))]
    {
        return KqueueEngine::new(maxsock).map(|e| Box::new(e) as Box<dyn Poller>).map_err(|err| {
            #[cfg(feature = "log")]
            log::warn!("kqueue backend failed to initialize: {err}");
            err
        });
    }
    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "ios",
        target_os = "macos",
        target_os = "netbsd",
        target_os = "openbsd",
    )))]
    {
        let _ = maxsock;
        Err(io::Error::new(io::ErrorKind::Unsupported, "no readiness backend for this platform"))
    }
}
