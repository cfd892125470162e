//! Back-end B: speculative edge-triggered readiness, grounded on the
//! original's `ev_sepoll.c`.
//!
//! Each fd carries two 2-bit states (one per direction): idle, spec (try
//! I/O without asking the kernel first) or poll (registered with epoll).
//! The original's third "stop" sub-state — a direction mid-removal during
//! iteration — collapses here into an immediate epoll_ctl update instead of
//! a deferred one; the external contract (`is_set`/`set`/`clear`/`poll`)
//! behaves identically, this implementation just does not defer the kernel
//! syscall across a single `poll()` call the way the original's in-place
//! list walk did.
//!
//! A dense side list holds every fd with at least one direction in `spec`
//! state; each fd's 1-based back-index into that list lives in
//! `side_index`, so removal is an O(1) swap-with-last and 0 unambiguously
//! means "not in the list" (see the design note on the speculative engine's
//! back-index).

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::fd::FdRegistry;
use crate::interest::Direction;
use crate::time::Tick;

use super::epoll::{self, EpollFd};
use super::Poller;

const MIN_RETURN_EVENTS: usize = 25;
const MAX_POLL_EVENTS: usize = 1024;
const MAX_WAIT: Duration = Duration::from_secs(1);

const IDLE: u8 = 0;
const SPEC: u8 = 1;
const POLL: u8 = 2;

pub struct SpecEpollEngine {
    ep: EpollFd,
    /// Per-fd, per-direction state: bits 0-1 for read, bits 2-3 for write.
    state: Vec<u8>,
    /// Currently-registered epoll bitmask per fd (0 = not registered).
    epoll_bits: Vec<u32>,
    side_list: Vec<RawFd>,
    side_index: Vec<usize>,
    created_this_turn: Vec<RawFd>,
    last_skipped: u8,
    events: Vec<libc::epoll_event>,
    maxsock: usize,
}

impl SpecEpollEngine {
    pub fn new(maxsock: usize) -> io::Result<SpecEpollEngine> {
        let ep = EpollFd::new()?;
        Ok(SpecEpollEngine {
            ep,
            state: vec![0; maxsock],
            epoll_bits: vec![0; maxsock],
            side_list: Vec::new(),
            side_index: vec![0; maxsock],
            created_this_turn: Vec::new(),
            last_skipped: 0,
            events: Vec::with_capacity(MAX_POLL_EVENTS.min(maxsock.max(1))),
            maxsock,
        })
    }

    fn abs_max_events(&self) -> usize {
        MAX_POLL_EVENTS.max(self.maxsock / 4)
    }

    fn dir_state(&self, fd: RawFd, dir: Direction) -> u8 {
        let s = self.state[fd as usize];
        match dir {
            Direction::Read => s & 0b11,
            Direction::Write => (s >> 2) & 0b11,
        }
    }

    fn set_dir_state(&mut self, fd: RawFd, dir: Direction, val: u8) {
        let s = &mut self.state[fd as usize];
        match dir {
            Direction::Read => *s = (*s & 0b1100) | val,
            Direction::Write => *s = (*s & 0b0011) | (val << 2),
        }
    }

    fn alloc_spec_entry(&mut self, fd: RawFd) {
        if self.side_index[fd as usize] != 0 {
            return;
        }
        self.side_list.push(fd);
        self.side_index[fd as usize] = self.side_list.len();
        self.created_this_turn.push(fd);
    }

    fn release_spec_entry(&mut self, fd: RawFd) {
        let idx = self.side_index[fd as usize];
        if idx == 0 {
            return;
        }
        let last = self.side_list.len();
        if idx != last {
            let moved = self.side_list[last - 1];
            self.side_list[idx - 1] = moved;
            self.side_index[moved as usize] = idx;
        }
        self.side_list.pop();
        self.side_index[fd as usize] = 0;
    }

    fn maybe_release(&mut self, fd: RawFd) {
        if self.dir_state(fd, Direction::Read) != SPEC && self.dir_state(fd, Direction::Write) != SPEC {
            self.release_spec_entry(fd);
        }
    }

    /// Reconcile the kernel's registration for `fd` with the current
    /// per-direction states: a direction registers with epoll iff it is in
    /// `Poll` state.
    fn sync_epoll(&mut self, fd: RawFd) -> io::Result<()> {
        let mut wanted = 0u32;
        if self.dir_state(fd, Direction::Read) == POLL {
            wanted |= EpollFd::dir_bits(Direction::Read);
        }
        if self.dir_state(fd, Direction::Write) == POLL {
            wanted |= EpollFd::dir_bits(Direction::Write);
        }
        let registered = self.epoll_bits[fd as usize];
        if wanted == registered {
            return Ok(());
        }
        if wanted == 0 {
            self.ep.ctl_del(fd)?;
        } else if registered == 0 {
            self.ep.ctl_add(fd, wanted)?;
        } else {
            self.ep.ctl_mod(fd, wanted)?;
        }
        self.epoll_bits[fd as usize] = wanted;
        Ok(())
    }

    /// Process one fd's speculative directions, invoking callbacks through
    /// `registry`. Returns the number of directions that reported non-zero
    /// work done.
    fn process_spec_fd(&mut self, registry: &mut FdRegistry, fd: RawFd) -> usize {
        let mut done = 0;
        for &dir in &Direction::ALL {
            if self.dir_state(fd, dir) == SPEC {
                if registry.get(fd).is_none() {
                    self.forget(fd);
                    return done;
                }
                let result = registry.dispatch(fd, dir).unwrap_or(0);
                if registry.get(fd).is_none() {
                    self.forget(fd);
                    return done;
                }
                if result == 0 {
                    self.set_dir_state(fd, dir, POLL);
                } else {
                    done += 1;
                }
            }
        }
        let _ = self.sync_epoll(fd);
        self.maybe_release(fd);
        done
    }

    fn forget(&mut self, fd: RawFd) {
        self.state[fd as usize] = 0;
        self.epoll_bits[fd as usize] = 0;
        self.release_spec_entry(fd);
    }
}

impl Poller for SpecEpollEngine {
    fn name(&self) -> &'static str {
        "spec-epoll"
    }

    fn is_set(&self, fd: RawFd, dir: Direction) -> bool {
        matches!(self.dir_state(fd, dir), SPEC | POLL)
    }

    fn set(&mut self, fd: RawFd, dir: Direction) -> io::Result<bool> {
        match self.dir_state(fd, dir) {
            SPEC | POLL => Ok(false),
            _ => {
                self.set_dir_state(fd, dir, SPEC);
                self.alloc_spec_entry(fd);
                Ok(true)
            }
        }
    }

    fn clear(&mut self, fd: RawFd, dir: Direction) -> io::Result<bool> {
        match self.dir_state(fd, dir) {
            IDLE => Ok(false),
            SPEC => {
                self.set_dir_state(fd, dir, IDLE);
                self.maybe_release(fd);
                Ok(true)
            }
            _ => {
                self.set_dir_state(fd, dir, IDLE);
                self.sync_epoll(fd)?;
                Ok(true)
            }
        }
    }

    fn close_notify(&mut self, fd: RawFd) {
        self.forget(fd);
    }

    fn poll(
        &mut self,
        registry: &mut FdRegistry,
        deadline: Option<Tick>,
        now: Tick,
    ) -> io::Result<()> {
        // Phase 1: backward spec-list walk.
        let mut done = 0;
        let mut processed = 0;
        let mut i = self.side_list.len();
        while i > 0 {
            i -= 1;
            if i >= self.side_list.len() {
                continue; // entries may have been removed mid-walk
            }
            let fd = self.side_list[i];
            processed += 1;
            done += self.process_spec_fd(registry, fd);
        }

        // Phase 2: decide wait time.
        let abs_max = self.abs_max_events();
        let skip = done >= MIN_RETURN_EVENTS && processed < abs_max && self.last_skipped == 0;
        let timeout = if skip {
            self.last_skipped = 1;
            Some(Duration::ZERO)
        } else {
            self.last_skipped = 0;
            if !self.side_list.is_empty() {
                Some(Duration::ZERO)
            } else {
                super::remaining(deadline, now, MAX_WAIT)
            }
        };

        // Phase 3: kernel wait + dispatch.
        let n = self.ep.wait(&mut self.events, timeout)?;
        for idx in 0..n {
            let ev = self.events[idx];
            let fd = epoll::event_fd(&ev);
            let readable = epoll::is_readable(&ev);
            let writable = epoll::is_writable(&ev);
            let error = epoll::is_error(&ev);
            registry.fold_event(fd, readable, writable, error);
            if registry.get(fd).is_none() {
                continue;
            }
            if readable && self.dir_state(fd, Direction::Read) == POLL {
                registry.dispatch(fd, Direction::Read);
            }
            if registry.get(fd).is_some() && writable && self.dir_state(fd, Direction::Write) == POLL {
                registry.dispatch(fd, Direction::Write);
            }
        }

        // Phase 4: post-accept re-poll, restricted to fds created in phases
        // 1-3 above (e.g. a listener's freshly-accepted children).
        if !self.created_this_turn.is_empty() {
            let created = std::mem::take(&mut self.created_this_turn);
            for fd in created {
                if registry.get(fd).is_none() {
                    continue;
                }
                self.process_spec_fd(registry, fd);
            }
        }
        self.created_this_turn.clear();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fd::{FdHandler, FdRegistry, Handler, Owner};
    use std::cell::RefCell;
    use std::rc::Rc;

    struct CountingHandler {
        read_done: usize,
    }

    impl FdHandler for CountingHandler {
        fn on_readable(&mut self, _fd: RawFd) -> usize {
            self.read_done
        }
    }

    fn make_pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        unsafe {
            libc::fcntl(fds[0], libc::F_SETFL, libc::O_NONBLOCK);
            libc::fcntl(fds[1], libc::F_SETFL, libc::O_NONBLOCK);
        }
        (fds[0], fds[1])
    }

    #[test]
    fn set_then_clear_toggles_state_without_kernel_registration() {
        let mut engine = SpecEpollEngine::new(1024).expect("epoll create");
        let (r, w) = make_pipe();

        assert!(engine.set(r, Direction::Read).unwrap());
        assert!(engine.is_set(r, Direction::Read));
        assert!(!engine.set(r, Direction::Read).unwrap(), "second set is a no-op");
        assert!(engine.clear(r, Direction::Read).unwrap());
        assert!(!engine.is_set(r, Direction::Read));

        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn poll_downgrades_spec_to_poll_on_zero_work_done() {
        let mut engine = SpecEpollEngine::new(1024).expect("epoll create");
        let mut registry = FdRegistry::new(1024);
        let (r, w) = make_pipe();

        let handler: Handler = Rc::new(RefCell::new(CountingHandler { read_done: 0 }));
        registry.insert(r, Owner::None, handler);
        engine.set(r, Direction::Read).unwrap();

        let expired = Tick::from_millis(0);
        engine.poll(&mut registry, Some(expired), expired).expect("poll");

        assert!(engine.is_set(r, Direction::Read), "direction stays registered, now via epoll");

        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn close_notify_forgets_the_fd() {
        let mut engine = SpecEpollEngine::new(1024).expect("epoll create");
        let (r, w) = make_pipe();

        engine.set(r, Direction::Read).unwrap();
        engine.close_notify(r);
        assert!(!engine.is_set(r, Direction::Read));

        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }
}
