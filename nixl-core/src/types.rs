//! Shared data model: memory-segment kinds, descriptors, and the opaque
//! handles engines hand back to the agent layer.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Memory-segment kind carried by every descriptor list. `Block` and `File`
/// are reserved; no core engine advertises them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemKind {
    HostDram,
    DeviceDram,
    Block,
    File,
    Object,
}

/// Direction of a transfer: `Read` pulls remote bytes into local memory,
/// `Write` pushes local bytes out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XferOp {
    Read,
    Write,
}

/// Input to `register_memory`. For `Object` registrations `meta` carries the
/// object key; an empty `meta` derives the key from `dev_id`.
#[derive(Clone, Debug, Default)]
pub struct RegDesc {
    pub addr: u64,
    pub len: u64,
    pub dev_id: u64,
    pub meta: Vec<u8>,
}

impl RegDesc {
    pub fn new(addr: u64, len: u64, dev_id: u64) -> Self {
        Self {
            addr,
            len,
            dev_id,
            meta: Vec::new(),
        }
    }

    pub fn with_meta(mut self, meta: impl Into<Vec<u8>>) -> Self {
        self.meta = meta.into();
        self
    }
}

/// Engine-private per-registration state behind a uniform clonable handle.
/// Engines downcast to their own concrete type.
#[derive(Clone)]
pub struct Registration(Arc<dyn Any + Send + Sync>);

impl Registration {
    pub fn new<T: Any + Send + Sync>(state: T) -> Self {
        Self(Arc::new(state))
    }

    pub fn downcast<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Registration(..)")
    }
}

/// One element of a transfer list: a memory slice plus the registration it
/// was carved from.
#[derive(Clone, Debug)]
pub struct MetaDesc {
    pub addr: u64,
    pub len: u64,
    pub dev_id: u64,
    pub meta: Registration,
}

impl MetaDesc {
    pub fn new(addr: u64, len: u64, dev_id: u64, meta: Registration) -> Self {
        Self {
            addr,
            len,
            dev_id,
            meta,
        }
    }
}

/// Ordered descriptor list carrying a single memory-segment kind.
#[derive(Clone, Debug)]
pub struct MetaDescList {
    kind: MemKind,
    descs: Vec<MetaDesc>,
}

impl MetaDescList {
    pub fn new(kind: MemKind) -> Self {
        Self {
            kind,
            descs: Vec::new(),
        }
    }

    pub fn kind(&self) -> MemKind {
        self.kind
    }

    pub fn push(&mut self, desc: MetaDesc) {
        self.descs.push(desc);
    }

    pub fn len(&self) -> usize {
        self.descs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descs.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MetaDesc> {
        self.descs.iter()
    }
}

impl std::ops::Index<usize> for MetaDescList {
    type Output = MetaDesc;

    fn index(&self, idx: usize) -> &MetaDesc {
        &self.descs[idx]
    }
}

/// Engine-private transfer-request state behind a uniform owned handle.
///
/// The aggregate status is monotonic (`InProgress* (Done | error)`), a handle
/// may not be posted twice, and releasing it cancels still-pending
/// sub-operations.
pub struct XferHandle(Box<dyn Any + Send>);

impl XferHandle {
    pub fn new<T: Any + Send>(state: T) -> Self {
        Self(Box::new(state))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    pub fn downcast_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.0.downcast_mut::<T>()
    }

    pub fn into_inner<T: Any>(self) -> Option<Box<T>> {
        self.0.downcast::<T>().ok()
    }
}

impl fmt::Debug for XferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("XferHandle(..)")
    }
}

/// Out-of-band message delivered reliably and in per-sender order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub agent: String,
    pub payload: Vec<u8>,
}

pub type NotifList = Vec<Notification>;
