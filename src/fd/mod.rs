//! The FD registry: a dense, fd-indexed arena holding per-descriptor state
//! and the callback pair the readiness engine dispatches into.
//!
//! Grounded on the "FD registry as arena" design note: state is preallocated
//! to `maxsock` slots at startup and never grows while a `poll()` call is in
//! flight; a slot's `state` field is the only authoritative lifetime marker,
//! the same discipline `util::slab::Slab` uses for its free list, generalized
//! here to be indexed directly by the raw fd rather than by an opaque token.

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::interest::Direction;
use crate::token::Token;

/// Lifecycle state of a registered descriptor.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FdState {
    New,
    Listening,
    Connecting,
    Ready,
    Error,
    Closed,
}

/// What a slot belongs to, kept only for diagnostics and log attribution —
/// dispatch itself goes through `handler` regardless of owner kind.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Owner {
    None,
    Listener(Token),
    StreamInterface(Token),
}

/// Anything that can sit behind an FD slot and receive readiness callbacks.
///
/// Implementations live behind `Rc<RefCell<_>>` so that a stream interface
/// (itself reachable from its owning session) can also be the registry's
/// callback target without the registry owning it outright — matching the
/// single-threaded, no-internal-locking scheduling model: there is exactly
/// one mutable borrow in flight at a time because only the event loop thread
/// ever calls in.
pub trait FdHandler {
    /// The fd became (speculatively or confirmed) readable. Returns the
    /// number of "things done"; 0 tells the speculative engine to downgrade
    /// from spec to poll for this direction.
    fn on_readable(&mut self, fd: RawFd) -> usize {
        let _ = fd;
        0
    }

    /// Mirror of [`FdHandler::on_readable`] for the write direction.
    fn on_writable(&mut self, fd: RawFd) -> usize {
        let _ = fd;
        0
    }
}

pub type Handler = Rc<RefCell<dyn FdHandler>>;

/// Per-fd bookkeeping. `scratch` is engine-private: the speculative engine
/// stores its 1-based side-list back-index there (0 = not in the list).
pub struct FdSlot {
    pub state: FdState,
    pub owner: Owner,
    pub handler: Option<Handler>,
    pub sticky_read: bool,
    pub sticky_write: bool,
    pub sticky_error: bool,
    pub scratch: usize,
}

impl FdSlot {
    fn empty() -> FdSlot {
        FdSlot {
            state: FdState::Closed,
            owner: Owner::None,
            handler: None,
            sticky_read: false,
            sticky_write: false,
            sticky_error: false,
            scratch: 0,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == FdState::Closed
    }
}

/// Dense array indexed by raw fd, preallocated to `maxsock` at construction.
pub struct FdRegistry {
    slots: Vec<FdSlot>,
}

impl FdRegistry {
    pub fn new(maxsock: usize) -> FdRegistry {
        let mut slots = Vec::with_capacity(maxsock);
        slots.resize_with(maxsock, FdSlot::empty);
        FdRegistry { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Register a freshly-created fd with its owner and handler. The caller
    /// is responsible for having already made the fd non-blocking.
    pub fn insert(&mut self, fd: RawFd, owner: Owner, handler: Handler) {
        let slot = self.slot_mut(fd);
        slot.state = FdState::New;
        slot.owner = owner;
        slot.handler = Some(handler);
        slot.sticky_read = false;
        slot.sticky_write = false;
        slot.sticky_error = false;
        slot.scratch = 0;
    }

    pub fn get(&self, fd: RawFd) -> Option<&FdSlot> {
        self.slots.get(fd as usize).filter(|s| !s.is_closed())
    }

    pub fn get_mut(&mut self, fd: RawFd) -> Option<&mut FdSlot> {
        let closed = self.slots.get(fd as usize).map(|s| s.is_closed());
        if closed == Some(false) {
            self.slots.get_mut(fd as usize)
        } else {
            None
        }
    }

    fn slot_mut(&mut self, fd: RawFd) -> &mut FdSlot {
        &mut self.slots[fd as usize]
    }

    /// Mark a descriptor closed, severing every reference the registry
    /// holds. Invariant: after this returns, no callback for `fd` will run
    /// in the current turn or any future one — the engine's own close-path
    /// must also purge its side lists, which is why engines call this
    /// *through* [`crate::poller::Poller::close_notify`] rather than
    /// directly.
    pub fn close_notify(&mut self, fd: RawFd) {
        if let Some(slot) = self.slots.get_mut(fd as usize) {
            slot.state = FdState::Closed;
            slot.owner = Owner::None;
            slot.handler = None;
            slot.sticky_read = false;
            slot.sticky_write = false;
            slot.sticky_error = false;
            slot.scratch = 0;
        }
    }

    pub fn set_state(&mut self, fd: RawFd, state: FdState) {
        if let Some(slot) = self.get_mut(fd) {
            slot.state = state;
        }
    }

    /// Dispatch `dir`'s callback for `fd`, if the slot is still live. Returns
    /// `None` if the fd was closed (by a prior callback in the same turn, or
    /// never registered) so the caller can skip any remaining bookkeeping.
    pub fn dispatch(&mut self, fd: RawFd, dir: Direction) -> Option<usize> {
        let handler = {
            let slot = self.get(fd)?;
            slot.handler.clone()?
        };
        let done = match dir {
            Direction::Read => handler.borrow_mut().on_readable(fd),
            Direction::Write => handler.borrow_mut().on_writable(fd),
        };
        // Re-check: the callback may have closed its own fd.
        if self.get(fd).is_some() {
            Some(done)
        } else {
            None
        }
    }

    pub fn fold_event(&mut self, fd: RawFd, readable: bool, writable: bool, error: bool) {
        if let Some(slot) = self.get_mut(fd) {
            slot.sticky_read |= readable;
            slot.sticky_write |= writable;
            slot.sticky_error |= error;
        }
    }
}
