//! Back-end A: a plain kernel event queue (kqueue), grounded on
//! `sys/unix/selector/kqueue.rs`'s `Selector` and on the original's
//! `ev_kqueue.c`. Maintains two fd-indexed bitsets (one per direction);
//! `set`/`clear` enqueue a single-entry change against the kernel queue,
//! `poll` waits with a preallocated event array sized
//! `min(maxfd, max_poll_events)`.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr;
use std::time::Duration;

use crate::fd::FdRegistry;
use crate::interest::Direction;
use crate::time::Tick;

use super::Poller;

const MAX_POLL_EVENTS: usize = 1024;
const MAX_WAIT: Duration = Duration::from_secs(1);

#[cfg(not(target_os = "netbsd"))]
type Count = libc::c_int;
#[cfg(target_os = "netbsd")]
type Count = libc::size_t;

pub struct KqueueEngine {
    kq: RawFd,
    read_set: Vec<bool>,
    write_set: Vec<bool>,
    events: Vec<libc::kevent>,
}

macro_rules! kevent {
    ($id:expr, $filter:expr, $flags:expr) => {
        libc::kevent {
            ident: $id as libc::uintptr_t,
            filter: $filter as _,
            flags: $flags,
            fflags: 0,
            data: 0,
            udata: ptr::null_mut(),
        }
    };
}

impl KqueueEngine {
    pub fn new(maxsock: usize) -> io::Result<KqueueEngine> {
        let kq = syscall!(kqueue())?;
        syscall!(fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC))?;
        Ok(KqueueEngine {
            kq,
            read_set: vec![false; maxsock],
            write_set: vec![false; maxsock],
            events: Vec::with_capacity(MAX_POLL_EVENTS.min(maxsock.max(1))),
        })
    }

    fn set_for(&self, dir: Direction) -> &Vec<bool> {
        match dir {
            Direction::Read => &self.read_set,
            Direction::Write => &self.write_set,
        }
    }

    fn set_for_mut(&mut self, dir: Direction) -> &mut Vec<bool> {
        match dir {
            Direction::Read => &mut self.read_set,
            Direction::Write => &mut self.write_set,
        }
    }

    fn filter(dir: Direction) -> i16 {
        match dir {
            Direction::Read => libc::EVFILT_READ as i16,
            Direction::Write => libc::EVFILT_WRITE as i16,
        }
    }

    fn change(&self, fd: RawFd, flags: u16, dir: Direction) -> io::Result<()> {
        let mut kev = kevent!(fd, Self::filter(dir), flags | libc::EV_RECEIPT as u16);
        syscall!(kevent(self.kq, &kev, 1, &mut kev, 1, ptr::null())).map(|_| ())?;
        if (kev.flags & libc::EV_ERROR as u16) != 0 && kev.data != 0 {
            let errno = kev.data as i32;
            if errno != libc::ENOENT {
                return Err(io::Error::from_raw_os_error(errno));
            }
        }
        Ok(())
    }
}

impl Poller for KqueueEngine {
    fn name(&self) -> &'static str {
        "kqueue"
    }

    fn is_set(&self, fd: RawFd, dir: Direction) -> bool {
        self.set_for(dir).get(fd as usize).copied().unwrap_or(false)
    }

    fn set(&mut self, fd: RawFd, dir: Direction) -> io::Result<bool> {
        if self.is_set(fd, dir) {
            return Ok(false);
        }
        self.change(fd, (libc::EV_ADD | libc::EV_CLEAR) as u16, dir)?;
        self.set_for_mut(dir)[fd as usize] = true;
        Ok(true)
    }

    fn clear(&mut self, fd: RawFd, dir: Direction) -> io::Result<bool> {
        if !self.is_set(fd, dir) {
            return Ok(false);
        }
        self.change(fd, libc::EV_DELETE as u16, dir)?;
        self.set_for_mut(dir)[fd as usize] = false;
        Ok(true)
    }

    fn close_notify(&mut self, fd: RawFd) {
        // The kernel drops kqueue registrations automatically when the fd is
        // closed; we only need to forget our own bitset entries.
        if let Some(slot) = self.read_set.get_mut(fd as usize) {
            *slot = false;
        }
        if let Some(slot) = self.write_set.get_mut(fd as usize) {
            *slot = false;
        }
    }

    fn poll(
        &mut self,
        registry: &mut FdRegistry,
        deadline: Option<Tick>,
        now: Tick,
    ) -> io::Result<()> {
        let timeout = super::remaining(deadline, now, MAX_WAIT);
        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
            tv_nsec: libc::c_long::from(d.subsec_nanos() as i32),
        });
        let ts_ptr = ts
            .as_ref()
            .map(|s| s as *const libc::timespec)
            .unwrap_or(ptr::null());

        self.events.clear();
        let n = syscall!(kevent(
            self.kq,
            ptr::null(),
            0,
            self.events.as_mut_ptr(),
            self.events.capacity() as Count,
            ts_ptr,
        ))?;
        unsafe { self.events.set_len(n as usize) };

        for ev in &self.events {
            let fd = ev.ident as RawFd;
            let dir = if ev.filter == libc::EVFILT_READ as _ {
                Direction::Read
            } else if ev.filter == libc::EVFILT_WRITE as _ {
                Direction::Write
            } else {
                continue;
            };
            let error = ev.flags & libc::EV_EOF as u16 != 0 && ev.fflags != 0;
            registry.fold_event(fd, dir == Direction::Read, dir == Direction::Write, error);
            if self.is_set(fd, dir) && registry.get(fd).is_some() {
                registry.dispatch(fd, dir);
            }
        }
        Ok(())
    }
}

impl Drop for KqueueEngine {
    fn drop(&mut self) {
        let _ = syscall!(close(self.kq));
    }
}

impl AsRawFd for KqueueEngine {
    fn as_raw_fd(&self) -> RawFd {
        self.kq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fd::{FdHandler, FdRegistry, Handler, Owner};
    use std::cell::RefCell;
    use std::rc::Rc;

    struct CountingHandler {
        reads: usize,
    }

    impl FdHandler for CountingHandler {
        fn on_readable(&mut self, _fd: RawFd) -> usize {
            self.reads += 1;
            self.reads
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
    fn set_then_clear_toggles_is_set() {
        let mut engine = KqueueEngine::new(1024).expect("kqueue create");
        let (r, w) = make_pipe();

        assert!(engine.set(r, Direction::Read).expect("set"));
        assert!(engine.is_set(r, Direction::Read));
        assert!(!engine.set(r, Direction::Read).expect("set again is a no-op"));
        assert!(engine.clear(r, Direction::Read).expect("clear"));
        assert!(!engine.is_set(r, Direction::Read));

        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn poll_dispatches_on_write_then_read() {
        let mut engine = KqueueEngine::new(1024).expect("kqueue create");
        let mut registry = FdRegistry::new(1024);
        let (r, w) = make_pipe();

        let handler: Handler = Rc::new(RefCell::new(CountingHandler { reads: 0 }));
        registry.insert(r, Owner::None, handler.clone());
        engine.set(r, Direction::Read).expect("set");

        unsafe {
            let byte = [1u8];
            libc::write(w, byte.as_ptr() as *const libc::c_void, 1);
        }

        let now = Tick::from_millis(0);
        engine.poll(&mut registry, Some(now), now).expect("poll");

        assert_eq!(handler.borrow().reads, 1);

        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn close_notify_clears_both_directions() {
        let mut engine = KqueueEngine::new(1024).expect("kqueue create");
        let (r, w) = make_pipe();

        engine.set(r, Direction::Read).expect("set");
        engine.close_notify(r);
        assert!(!engine.is_set(r, Direction::Read));
        assert!(!engine.is_set(r, Direction::Write));

        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }
}
