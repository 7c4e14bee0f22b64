//! Intrusive chain of in-flight transport request slots.
//!
//! Slots are pool-owned by their worker; a transfer handle threads them
//! through an embedded link so aggregating N outstanding requests costs no
//! further allocation. Completion is a single state byte set by the worker
//! that executes the operation.
//!
//! Safety contract: link fields are touched only by the thread operating the
//! owning transfer handle (handles are `&mut`-exclusive); the state byte is
//! atomic and may be written concurrently by the executing worker.

use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, Ordering};

pub const REQ_IN_PROGRESS: u8 = 0;
pub const REQ_DONE: u8 = 1;
pub const REQ_ERROR: u8 = 2;
pub const REQ_CANCELLED: u8 = 3;
/// Released by its owner while still in flight; the executing worker
/// returns it to the pool once the operation settles.
pub const REQ_DETACHED: u8 = 4;

#[derive(Default)]
struct Link {
    next: Option<NonNull<ReqSlot>>,
    prev: Option<NonNull<ReqSlot>>,
}

pub struct ReqSlot {
    link: UnsafeCell<Link>,
    state: AtomicU8,
}

// State is atomic; links follow the module safety contract above.
unsafe impl Send for ReqSlot {}
unsafe impl Sync for ReqSlot {}

impl Default for ReqSlot {
    fn default() -> Self {
        Self {
            link: UnsafeCell::new(Link::default()),
            state: AtomicU8::new(REQ_IN_PROGRESS),
        }
    }
}

impl ReqSlot {
    pub fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    pub fn set_state(&self, state: u8) {
        self.state.store(state, Ordering::Release);
    }

    pub fn swap_state(&self, state: u8) -> u8 {
        self.state.swap(state, Ordering::AcqRel)
    }

    pub fn try_transition(&self, from: u8, to: u8) -> bool {
        self.state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn reset(&self) {
        self.set_state(REQ_IN_PROGRESS);
    }
}

/// Reference to a pool-owned request slot.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ReqToken(pub(crate) NonNull<ReqSlot>);

unsafe impl Send for ReqToken {}

impl ReqToken {
    pub(crate) fn new(ptr: NonNull<ReqSlot>) -> Self {
        Self(ptr)
    }

    pub fn slot(&self) -> &ReqSlot {
        // Slots stay pool-owned for the worker's lifetime; tokens never
        // outlive the worker that allocated them.
        unsafe { self.0.as_ref() }
    }

    pub fn is_complete(&self) -> bool {
        self.slot().state() == REQ_DONE
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn link(&self) -> &mut Link {
        unsafe { &mut *self.slot().link.get() }
    }
}

/// Ordered list of outstanding request slots backing one transfer handle.
pub struct ReqList {
    head: Option<NonNull<ReqSlot>>,
    tail: Option<NonNull<ReqSlot>>,
    len: usize,
}

unsafe impl Send for ReqList {}

impl Default for ReqList {
    fn default() -> Self {
        Self::new()
    }
}

impl ReqList {
    pub fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push_back(&mut self, tok: ReqToken) {
        unsafe {
            let link = tok.link();
            link.next = None;
            link.prev = self.tail;
            if let Some(tail) = self.tail {
                ReqToken::new(tail).link().next = Some(tok.0);
            } else {
                self.head = Some(tok.0);
            }
        }
        self.tail = Some(tok.0);
        self.len += 1;
    }

    pub fn pop_front(&mut self) -> Option<ReqToken> {
        let head = self.head?;
        let tok = ReqToken::new(head);
        unsafe {
            let link = tok.link();
            self.head = link.next;
            link.next = None;
            link.prev = None;
            match self.head {
                Some(next) => ReqToken::new(next).link().prev = None,
                None => self.tail = None,
            }
        }
        self.len -= 1;
        Some(tok)
    }

    /// Visits every slot in insertion order.
    pub fn for_each(&self, mut visit: impl FnMut(ReqToken)) {
        let mut cur = self.head;
        while let Some(ptr) = cur {
            let tok = ReqToken::new(ptr);
            cur = unsafe { tok.link() }.next;
            visit(tok);
        }
    }

    /// Visits every slot in order, unlinking those for which `keep` returns
    /// false.
    pub fn retain(&mut self, mut keep: impl FnMut(ReqToken) -> bool) {
        let mut cur = self.head;
        while let Some(ptr) = cur {
            let tok = ReqToken::new(ptr);
            let next = unsafe { tok.link() }.next;
            if !keep(tok) {
                self.unlink(tok);
            }
            cur = next;
        }
    }

    fn unlink(&mut self, tok: ReqToken) {
        unsafe {
            let link = tok.link();
            let (prev, next) = (link.prev, link.next);
            link.prev = None;
            link.next = None;
            match prev {
                Some(prev) => ReqToken::new(prev).link().next = next,
                None => self.head = next,
            }
            match next {
                Some(next) => ReqToken::new(next).link().prev = prev,
                None => self.tail = prev,
            }
        }
        self.len -= 1;
    }
}
