//! Raw epoll syscall wrapper, grounded on `sys/unix/selector/epoll.rs`'s
//! `Selector`. Unlike that file this one is not a public back-end on its
//! own: the speculative engine ([`super::spec`]) is the only consumer, so
//! the wrapper stores the bare fd (not a `Token`) in `epoll_event.u64` —
//! the speculative engine dispatches by fd anyway.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use crate::interest::Direction;

pub(super) struct EpollFd {
    ep: OwnedFd,
}

impl EpollFd {
    pub(super) fn new() -> io::Result<EpollFd> {
        syscall!(epoll_create1(libc::EPOLL_CLOEXEC)).map(|ep| EpollFd {
            ep: unsafe { OwnedFd::from_raw_fd(ep) },
        })
    }

    /// `EPOLLET` is always set: both back-ends that use this wrapper are
    /// edge-triggered by design (the speculative engine depends on it to
    /// keep its poll-bit diffing meaningful).
    fn bits(dir: Direction) -> u32 {
        match dir {
            Direction::Read => (libc::EPOLLIN | libc::EPOLLRDHUP) as u32,
            Direction::Write => libc::EPOLLOUT as u32,
        }
    }

    pub(super) fn ctl_add(&self, fd: RawFd, bits: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, bits)
    }

    pub(super) fn ctl_mod(&self, fd: RawFd, bits: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, bits)
    }

    pub(super) fn ctl_del(&self, fd: RawFd) -> io::Result<()> {
        let mut event = libc::epoll_event { events: 0, u64: fd as u64 };
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_DEL,
            fd,
            &mut event
        ))
        .map(|_| ())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, bits: u32) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: bits | libc::EPOLLET as u32,
            u64: fd as u64,
        };
        syscall!(epoll_ctl(self.ep.as_raw_fd(), op, fd, &mut event)).map(|_| ())
    }

    pub(super) fn dir_bits(dir: Direction) -> u32 {
        Self::bits(dir)
    }

    pub(super) fn wait(
        &self,
        events: &mut Vec<libc::epoll_event>,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let timeout_ms = match timeout {
            None => -1,
            Some(d) => {
                let ms = d
                    .checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(d)
                    .as_millis();
                ms.min(libc::c_int::MAX as u128) as libc::c_int
            }
        };
        events.clear();
        let cap = events.capacity();
        syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            events.as_mut_ptr(),
            cap as libc::c_int,
            timeout_ms,
        ))
        .map(|n| {
            unsafe { events.set_len(n as usize) };
            n as usize
        })
    }
}

pub(super) fn event_fd(ev: &libc::epoll_event) -> RawFd {
    ev.u64 as RawFd
}

pub(super) fn is_readable(ev: &libc::epoll_event) -> bool {
    ev.events & (libc::EPOLLIN | libc::EPOLLRDHUP) as u32 != 0
}

pub(super) fn is_writable(ev: &libc::epoll_event) -> bool {
    ev.events & libc::EPOLLOUT as u32 != 0
}

pub(super) fn is_error(ev: &libc::epoll_event) -> bool {
    ev.events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0
}
