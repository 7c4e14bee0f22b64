//! Process-local fabric: the connection-oriented, memory-registration-based
//! transport the RDMA engine drives.
//!
//! Workers publish opaque 16-byte addresses through a process-global router;
//! peers connect endpoints by address, import packed region keys, and issue
//! one-sided reads/writes plus small eager active messages. Operations are
//! queued on the initiating worker and executed in FIFO order by its
//! `progress()`, which is what makes `flush` a barrier: it completes only
//! after everything queued before it.

use std::collections::{HashMap, VecDeque};
use std::ptr::NonNull;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, warn};
use parking_lot::{Condvar, Mutex, RwLock};

use nixl_core::{EngineError, Result, XferStatus};

use crate::chain::{
    ReqSlot, ReqToken, REQ_CANCELLED, REQ_DETACHED, REQ_DONE, REQ_ERROR, REQ_IN_PROGRESS,
};

pub const WORKER_ADDR_BYTES: usize = 16;
pub const PACKED_KEY_BYTES: usize = 16;

/// One-sided transfers at or below this size complete inline at post time.
pub const INLINE_COPY_MAX: usize = 64;

/// Payloads above this size are delivered with the rendezvous bit set unless
/// the sender forced the eager protocol.
pub const EAGER_MAX_BYTES: usize = 8192;

pub const AM_FLAG_EAGER: u32 = 0x1;

/// Thread-safety level the context is initialized with. Worker-level safety
/// is required to run a progress thread next to caller threads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MtLevel {
    Single,
    Context,
    Worker,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerAddr([u8; WORKER_ADDR_BYTES]);

impl WorkerAddr {
    fn generate() -> Self {
        Self(rand::random())
    }

    pub fn to_bytes(self) -> Bytes {
        Bytes::copy_from_slice(&self.0)
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; WORKER_ADDR_BYTES] = bytes.try_into().ok()?;
        Some(Self(raw))
    }
}

impl std::fmt::Debug for WorkerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        f.write_str("..")
    }
}

/// Process-global worker registry standing in for the wire.
struct Router {
    workers: Mutex<HashMap<WorkerAddr, Weak<WorkerCore>>>,
}

fn router() -> &'static Router {
    static ROUTER: OnceLock<Router> = OnceLock::new();
    ROUTER.get_or_init(|| Router {
        workers: Mutex::new(HashMap::new()),
    })
}

impl Router {
    fn publish(&self, addr: WorkerAddr, core: &Arc<WorkerCore>) {
        self.workers.lock().insert(addr, Arc::downgrade(core));
    }

    fn withdraw(&self, addr: WorkerAddr) {
        self.workers.lock().remove(&addr);
    }

    fn resolve(&self, addr: WorkerAddr) -> Option<Arc<WorkerCore>> {
        let mut workers = self.workers.lock();
        match workers.get(&addr) {
            Some(weak) => match weak.upgrade() {
                Some(core) => Some(core),
                None => {
                    workers.remove(&addr);
                    None
                }
            },
            None => None,
        }
    }
}

/// Wakeup channel workers share with their context; the analog of arming
/// worker file descriptors and polling them.
#[derive(Clone, Default)]
pub(crate) struct WorkerEvent(Arc<EventInner>);

#[derive(Default)]
struct EventInner {
    signalled: Mutex<bool>,
    cv: Condvar,
}

impl WorkerEvent {
    fn signal(&self) {
        let mut flag = self.0.signalled.lock();
        *flag = true;
        self.0.cv.notify_all();
    }

    /// Waits until signalled or the timeout elapses; consumes the signal.
    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut flag = self.0.signalled.lock();
        while !*flag {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.0.cv.wait_for(&mut flag, deadline - now);
        }
        *flag = false;
        true
    }
}

/// Process-wide transport initializer; owns the device list and the shared
/// worker event.
pub struct FabricContext {
    devices: Vec<String>,
    mt_level: MtLevel,
    event: WorkerEvent,
}

impl FabricContext {
    pub fn new(devices: Vec<String>, mt_level: MtLevel) -> Arc<Self> {
        if !devices.is_empty() {
            debug!("fabric context restricted to devices {devices:?}");
        }
        Arc::new(Self {
            devices,
            mt_level,
            event: WorkerEvent::default(),
        })
    }

    pub fn mt_level_supported(_level: MtLevel) -> bool {
        true
    }

    pub fn devices(&self) -> &[String] {
        &self.devices
    }

    pub fn mt_level(&self) -> MtLevel {
        self.mt_level
    }

    /// Registers a local memory segment for one-sided access.
    pub fn register_memory(&self, base: u64, len: u64) -> Result<MemRegion> {
        if len == 0 {
            return Err(EngineError::invalid("cannot register an empty region"));
        }
        if base.checked_add(len).is_none() {
            return Err(EngineError::invalid("registered region wraps the address space"));
        }
        Ok(MemRegion { base, len })
    }

    /// Blocks until any worker of this context receives work, up to
    /// `timeout`. Returns whether a wakeup arrived.
    pub fn wait_event(&self, timeout: Duration) -> bool {
        self.event.wait(timeout)
    }

    /// Wakes a `wait_event` sleeper without queueing work.
    pub fn wake(&self) {
        self.event.signal();
    }
}

/// Local registration handle: the segment one-sided operations validate
/// local descriptors against.
#[derive(Clone, Copy, Debug)]
pub struct MemRegion {
    base: u64,
    len: u64,
}

impl MemRegion {
    pub fn pack_key(&self) -> Bytes {
        let mut out = Vec::with_capacity(PACKED_KEY_BYTES);
        out.extend_from_slice(&self.base.to_le_bytes());
        out.extend_from_slice(&self.len.to_le_bytes());
        Bytes::from(out)
    }

    fn covers(&self, addr: u64, len: usize) -> bool {
        addr >= self.base
            && addr
                .checked_add(len as u64)
                .is_some_and(|end| end <= self.base + self.len)
    }
}

/// Imported view of a peer's registered region.
#[derive(Clone, Copy, Debug)]
pub struct RemoteKey {
    base: u64,
    len: u64,
}

impl RemoteKey {
    pub fn unpack(blob: &[u8]) -> Result<Self> {
        if blob.len() != PACKED_KEY_BYTES {
            return Err(EngineError::invalid("malformed packed region key"));
        }
        let base = u64::from_le_bytes(blob[..8].try_into().expect("eight bytes"));
        let len = u64::from_le_bytes(blob[8..].try_into().expect("eight bytes"));
        Ok(Self { base, len })
    }

    fn covers(&self, addr: u64, len: usize) -> bool {
        addr >= self.base
            && addr
                .checked_add(len as u64)
                .is_some_and(|end| end <= self.base + self.len)
    }
}

pub struct AmHeader {
    pub op: u8,
}

/// Inbound active message as seen by a registered handler.
pub struct AmRecv<'a> {
    pub header: AmHeader,
    pub payload: &'a [u8],
    pub rendezvous: bool,
}

pub type AmHandler = Box<dyn Fn(AmRecv<'_>) -> Result<()> + Send + Sync>;

struct AmDelivery {
    op: u8,
    payload: Vec<u8>,
    rendezvous: bool,
}

enum OpKind {
    Copy { src: u64, dst: u64, len: usize },
    Flush,
    Am { peer: Weak<WorkerCore>, delivery: AmDelivery },
}

struct PendingOp {
    kind: OpKind,
    req: ReqToken,
    /// Progress passes left before the operation executes; models transport
    /// completion latency so large transfers stay in flight across polls.
    ticks: u32,
}

fn copy_ticks(len: usize) -> u32 {
    (2 + len as u32 / 1024).min(32)
}

/// Result of posting a transport operation.
pub enum OpStatus {
    /// Completed inline; no request slot was consumed.
    Completed,
    /// In flight; track the slot until `test` reports completion.
    Pending(ReqToken),
}

#[derive(Default)]
struct SlotPool {
    slots: Vec<Box<ReqSlot>>,
    free: Vec<NonNull<ReqSlot>>,
}

// Boxes are owned by the pool; NonNulls in `free` point into them.
unsafe impl Send for SlotPool {}

impl SlotPool {
    fn alloc(&mut self) -> ReqToken {
        match self.free.pop() {
            Some(ptr) => {
                let tok = ReqToken::new(ptr);
                tok.slot().reset();
                tok
            }
            None => {
                let boxed = Box::new(ReqSlot::default());
                let ptr = NonNull::from(boxed.as_ref());
                self.slots.push(boxed);
                ReqToken::new(ptr)
            }
        }
    }

    fn release(&mut self, tok: ReqToken) {
        tok.slot().reset();
        self.free.push(tok.0);
    }
}

pub(crate) struct WorkerCore {
    addr: WorkerAddr,
    event: WorkerEvent,
    inbox: Mutex<VecDeque<AmDelivery>>,
    ops: Mutex<VecDeque<PendingOp>>,
    handlers: RwLock<HashMap<u8, AmHandler>>,
    pool: Mutex<SlotPool>,
    /// Serializes operation execution so FIFO order (and thus the flush
    /// barrier) holds when caller threads and the progress thread race.
    progress_lock: Mutex<()>,
}

impl WorkerCore {
    fn execute(&self, op: PendingOp) {
        let outcome = match op.kind {
            OpKind::Copy { src, dst, len } => {
                // Both sides were bounds-checked against registered regions
                // at post time; regions stay valid until deregistration.
                unsafe {
                    std::ptr::copy(src as *const u8, dst as *mut u8, len);
                }
                REQ_DONE
            }
            OpKind::Flush => REQ_DONE,
            OpKind::Am { peer, delivery } => match peer.upgrade() {
                Some(peer) => {
                    peer.inbox.lock().push_back(delivery);
                    peer.event.signal();
                    REQ_DONE
                }
                None => {
                    warn!("active message dropped: peer worker is gone");
                    REQ_ERROR
                }
            },
        };

        if op.req.slot().swap_state(outcome) == REQ_DETACHED {
            // Owner released the request mid-flight; reclaim it here.
            self.pool.lock().release(op.req);
        }
    }

    fn deliver(&self, delivery: AmDelivery) {
        let handlers = self.handlers.read();
        match handlers.get(&delivery.op) {
            Some(handler) => {
                let recv = AmRecv {
                    header: AmHeader { op: delivery.op },
                    payload: &delivery.payload,
                    rendezvous: delivery.rendezvous,
                };
                if let Err(err) = handler(recv) {
                    warn!("active message handler for opcode {} failed: {err}", delivery.op);
                }
            }
            None => warn!("dropping active message with unknown opcode {}", delivery.op),
        }
    }
}

/// Independent transport progress context; hosts endpoints, registered
/// keys, and the callbacks for inbound active messages.
pub struct FabricWorker {
    core: Arc<WorkerCore>,
    #[allow(dead_code)]
    ctx: Arc<FabricContext>,
}

impl FabricWorker {
    pub fn new(ctx: &Arc<FabricContext>) -> Self {
        let addr = WorkerAddr::generate();
        let core = Arc::new(WorkerCore {
            addr,
            event: ctx.event.clone(),
            inbox: Mutex::new(VecDeque::new()),
            ops: Mutex::new(VecDeque::new()),
            handlers: RwLock::new(HashMap::new()),
            pool: Mutex::new(SlotPool::default()),
            progress_lock: Mutex::new(()),
        });
        router().publish(addr, &core);
        debug!("fabric worker {addr:?} published");
        Self {
            core,
            ctx: Arc::clone(ctx),
        }
    }

    pub fn addr_bytes(&self) -> Bytes {
        self.core.addr.to_bytes()
    }

    pub fn register_am_handler(&self, op: u8, handler: AmHandler) {
        self.core.handlers.write().insert(op, handler);
    }

    /// Connects an endpoint to the worker published at `addr`.
    pub fn connect(&self, addr: &[u8]) -> Result<Endpoint> {
        let addr = WorkerAddr::from_bytes(addr)
            .ok_or_else(|| EngineError::invalid("malformed worker address"))?;
        let peer = router()
            .resolve(addr)
            .ok_or_else(|| EngineError::not_found(format!("no worker at address {addr:?}")))?;
        Ok(Endpoint {
            peer: Arc::downgrade(&peer),
            peer_addr: addr,
        })
    }

    pub fn import_rkey(&self, ep: &Endpoint, blob: &[u8]) -> Result<RemoteKey> {
        if ep.peer.upgrade().is_none() {
            return Err(EngineError::backend(format!(
                "endpoint to {:?} is no longer reachable",
                ep.peer_addr
            )));
        }
        RemoteKey::unpack(blob)
    }

    pub fn write(
        &self,
        ep: &Endpoint,
        laddr: u64,
        lmem: &MemRegion,
        raddr: u64,
        rkey: &RemoteKey,
        len: usize,
    ) -> Result<OpStatus> {
        self.one_sided(ep, lmem, laddr, rkey, raddr, len, /* write: */ true)
    }

    pub fn read(
        &self,
        ep: &Endpoint,
        raddr: u64,
        rkey: &RemoteKey,
        laddr: u64,
        lmem: &MemRegion,
        len: usize,
    ) -> Result<OpStatus> {
        self.one_sided(ep, lmem, laddr, rkey, raddr, len, /* write: */ false)
    }

    #[allow(clippy::too_many_arguments)]
    fn one_sided(
        &self,
        ep: &Endpoint,
        lmem: &MemRegion,
        laddr: u64,
        rkey: &RemoteKey,
        raddr: u64,
        len: usize,
        write: bool,
    ) -> Result<OpStatus> {
        if ep.peer.upgrade().is_none() {
            return Err(EngineError::backend(format!(
                "endpoint to {:?} is no longer reachable",
                ep.peer_addr
            )));
        }
        if !lmem.covers(laddr, len) {
            return Err(EngineError::invalid(
                "local descriptor is outside its registered region",
            ));
        }
        if !rkey.covers(raddr, len) {
            return Err(EngineError::invalid(
                "remote descriptor is outside the imported key's region",
            ));
        }

        let (src, dst) = if write { (laddr, raddr) } else { (raddr, laddr) };
        if len <= INLINE_COPY_MAX {
            unsafe {
                std::ptr::copy(src as *const u8, dst as *mut u8, len);
            }
            return Ok(OpStatus::Completed);
        }

        let ticks = copy_ticks(len);
        Ok(OpStatus::Pending(
            self.enqueue(OpKind::Copy { src, dst, len }, ticks),
        ))
    }

    /// Barrier: completes only after every operation queued before it on
    /// this worker has executed.
    pub fn flush(&self, ep: &Endpoint) -> Result<OpStatus> {
        if ep.peer.upgrade().is_none() {
            return Err(EngineError::backend(format!(
                "endpoint to {:?} is no longer reachable",
                ep.peer_addr
            )));
        }
        Ok(OpStatus::Pending(self.enqueue(OpKind::Flush, 1)))
    }

    /// Queues an active message. The payload buffer is owned by the pending
    /// operation until delivery.
    pub fn send_am(
        &self,
        ep: &Endpoint,
        op: u8,
        payload: Vec<u8>,
        flags: u32,
    ) -> Result<OpStatus> {
        if ep.peer.upgrade().is_none() {
            return Err(EngineError::backend(format!(
                "endpoint to {:?} is no longer reachable",
                ep.peer_addr
            )));
        }
        let rendezvous = flags & AM_FLAG_EAGER == 0 && payload.len() > EAGER_MAX_BYTES;
        Ok(OpStatus::Pending(self.enqueue(
            OpKind::Am {
                peer: ep.peer.clone(),
                delivery: AmDelivery {
                    op,
                    payload,
                    rendezvous,
                },
            },
            1,
        )))
    }

    fn enqueue(&self, kind: OpKind, ticks: u32) -> ReqToken {
        let req = self.core.pool.lock().alloc();
        self.core.ops.lock().push_back(PendingOp { kind, req, ticks });
        self.core.event.signal();
        req
    }

    /// Executes queued operations and delivers inbound active messages.
    /// Returns the number of events processed.
    ///
    /// Operations execute strictly in queue order; an operation whose
    /// latency has not elapsed blocks everything behind it, which is what
    /// makes `flush` a barrier.
    pub fn progress(&self) -> usize {
        let _serial = self.core.progress_lock.lock();
        let mut count = 0;

        loop {
            let mut ops = self.core.ops.lock();
            let Some(front) = ops.front_mut() else {
                break;
            };
            front.ticks -= 1;
            count += 1;
            if front.ticks > 0 {
                break;
            }
            let op = ops.pop_front().expect("front exists");
            drop(ops);
            self.core.execute(op);
        }

        loop {
            let Some(delivery) = self.core.inbox.lock().pop_front() else {
                break;
            };
            self.core.deliver(delivery);
            count += 1;
        }

        count
    }

    /// Drives one progress pass, then reports the request's state.
    pub fn test(&self, tok: ReqToken) -> Result<XferStatus> {
        self.progress();
        match tok.slot().state() {
            REQ_IN_PROGRESS => Ok(XferStatus::InProgress),
            REQ_DONE => Ok(XferStatus::Done),
            REQ_CANCELLED => Err(EngineError::backend("request was cancelled")),
            _ => Err(EngineError::backend("transport request failed")),
        }
    }

    /// Cancels a request that has not started executing; requests already
    /// executed (or mid-execution) keep their outcome.
    pub fn req_cancel(&self, tok: ReqToken) {
        let _serial = self.core.progress_lock.lock();
        let mut ops = self.core.ops.lock();
        if let Some(idx) = ops.iter().position(|op| op.req == tok) {
            ops.remove(idx);
            tok.slot().set_state(REQ_CANCELLED);
        }
    }

    /// Returns the slot to the pool. In-flight slots are detached and
    /// reclaimed by the executing worker once they settle.
    pub fn req_release(&self, tok: ReqToken) {
        if tok.slot().try_transition(REQ_IN_PROGRESS, REQ_DETACHED) {
            return;
        }
        self.core.pool.lock().release(tok);
    }

    /// True when the worker is quiescent and a sleeper may wait on the
    /// context event; false means work is already queued.
    pub fn arm(&self) -> bool {
        self.core.ops.lock().is_empty() && self.core.inbox.lock().is_empty()
    }
}

impl Drop for FabricWorker {
    fn drop(&mut self) {
        router().withdraw(self.core.addr);
    }
}

/// Per-worker connection to a peer worker.
#[derive(Clone)]
pub struct Endpoint {
    peer: Weak<WorkerCore>,
    peer_addr: WorkerAddr,
}
