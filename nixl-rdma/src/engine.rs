//! RDMA-style backend engine: one-sided reads/writes between registered
//! regions of two agents, plus ordered out-of-band notifications.
//!
//! Caller threads are spread over a fixed worker pool; a transfer handle is
//! pinned at prep time to the worker chosen by hashing the calling thread,
//! so every operation on one handle touches exactly one worker. An optional
//! progress thread drives all workers when callers are not polling.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, warn};
use parking_lot::{Condvar, Mutex, RwLock};

use nixl_core::serdes::{TagDecoder, TagEncoder};
use nixl_core::{
    logging, BackendEngine, BackendParams, EngineError, MemKind, MetaDescList, NotifList,
    Notification, RegDesc, Registration, Result, XferHandle, XferOp, XferOptions, XferStatus,
};

use crate::chain::{ReqList, ReqToken};
use crate::device::{DeviceCtxTracker, DeviceQuery, HostOnlyQuery};
use crate::fabric::{
    Endpoint, FabricContext, FabricWorker, MemRegion, MtLevel, OpStatus, RemoteKey, AM_FLAG_EAGER,
};

const CONN_CHECK: u8 = 1;
const DISCONNECT: u8 = 2;
const NOTIF_STR: u8 = 3;

const TAG_NAME: &str = "name";
const TAG_MSG: &str = "msg";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConnState {
    /// Endpoints are up; no liveness check has flowed yet.
    Fresh,
    /// We sent our CONN_CHECK; the peer has not proven liveness to us.
    CheckSent,
    /// The peer's CONN_CHECK arrived.
    Established,
    Closed,
}

struct Connection {
    remote_agent: String,
    eps: Vec<Endpoint>,
    state: Mutex<ConnState>,
}

/// Local half of a registration: the fabric region plus its exported key.
struct RdmaLocalReg {
    mem: MemRegion,
    packed_key: Bytes,
}

/// Remote half: one imported key per worker plus the connection the keys
/// were imported through. The connection outlives every request using them.
struct RdmaRemoteReg {
    conn: Arc<Connection>,
    rkeys: Vec<RemoteKey>,
}

/// Engine-private transfer state: the chain of outstanding fabric requests
/// and the worker everything for this handle runs on.
struct RdmaXfer {
    chain: ReqList,
    worker_id: usize,
    posted: bool,
    latched: Option<EngineError>,
}

struct ProgressThreadCtl {
    enabled: bool,
    delay: Duration,
    stop: AtomicBool,
    active: Mutex<bool>,
    active_cv: Condvar,
    thread_id: RwLock<Option<ThreadId>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct EngineInner {
    local_agent: String,
    ctx: Arc<FabricContext>,
    workers: Vec<FabricWorker>,
    conn_blob: Bytes,
    conns: RwLock<HashMap<String, Arc<Connection>>>,
    notif_main: Mutex<NotifList>,
    /// Staging list owned by the progress thread.
    notif_pthr_private: Mutex<NotifList>,
    /// Handoff list the main thread drains.
    notif_pthr_shared: Mutex<NotifList>,
    device: Mutex<DeviceCtxTracker>,
    pthr: ProgressThreadCtl,
}

pub struct RdmaEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for RdmaEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RdmaEngine").finish()
    }
}

impl RdmaEngine {
    pub fn new(params: &BackendParams) -> Result<Self> {
        Self::with_device_query(params, Arc::new(HostOnlyQuery))
    }

    /// Builds the engine with an injected pointer classifier; the default
    /// treats every registration as host memory.
    pub fn with_device_query(
        params: &BackendParams,
        device_query: Arc<dyn DeviceQuery>,
    ) -> Result<Self> {
        logging::ensure_initialized();

        if params.num_workers == 0 {
            return Err(EngineError::invalid("num_workers must be non-zero"));
        }
        if params.enable_progress_thread && !FabricContext::mt_level_supported(MtLevel::Worker) {
            return Err(EngineError::unsupported(
                "progress thread requires worker-level thread safety",
            ));
        }

        let devices = params
            .custom
            .get("device_list")
            .map(|list| {
                list.split([',', ' '])
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let ctx = FabricContext::new(devices, MtLevel::Worker);

        let workers: Vec<FabricWorker> = (0..params.num_workers)
            .map(|_| FabricWorker::new(&ctx))
            .collect();
        let conn_blob = workers[0].addr_bytes();

        let inner = Arc::new_cyclic(|weak: &std::sync::Weak<EngineInner>| {
            for worker in &workers {
                register_am_callbacks(worker, weak.clone());
            }
            EngineInner {
                local_agent: params.local_agent.clone(),
                ctx,
                workers,
                conn_blob,
                conns: RwLock::new(HashMap::new()),
                notif_main: Mutex::new(Vec::new()),
                notif_pthr_private: Mutex::new(Vec::new()),
                notif_pthr_shared: Mutex::new(Vec::new()),
                device: Mutex::new(DeviceCtxTracker::from_env(device_query)),
                pthr: ProgressThreadCtl {
                    enabled: params.enable_progress_thread,
                    delay: Duration::from_millis(params.progress_delay_ms.max(1)),
                    stop: AtomicBool::new(false),
                    active: Mutex::new(false),
                    active_cv: Condvar::new(),
                    thread_id: RwLock::new(None),
                    handle: Mutex::new(None),
                },
            }
        });

        EngineInner::progress_thread_start(&inner);
        Ok(Self { inner })
    }

    pub fn local_agent(&self) -> &str {
        &self.inner.local_agent
    }
}

impl Drop for RdmaEngine {
    fn drop(&mut self) {
        // Callbacks hold only weak references, but the progress thread owns
        // a strong one; stop it before the engine goes away.
        self.inner.progress_thread_stop();
    }
}

fn register_am_callbacks(worker: &FabricWorker, weak: std::sync::Weak<EngineInner>) {
    let w = weak.clone();
    worker.register_am_handler(
        CONN_CHECK,
        Box::new(move |msg| match w.upgrade() {
            Some(inner) => inner.on_conn_check(msg),
            None => Ok(()),
        }),
    );

    let w = weak.clone();
    worker.register_am_handler(
        DISCONNECT,
        Box::new(move |msg| match w.upgrade() {
            Some(inner) => inner.on_disconnect(msg),
            None => Ok(()),
        }),
    );

    worker.register_am_handler(
        NOTIF_STR,
        Box::new(move |msg| match weak.upgrade() {
            Some(inner) => inner.on_notif(msg),
            None => Ok(()),
        }),
    );
}

impl EngineInner {
    fn on_conn_check(&self, msg: crate::fabric::AmRecv<'_>) -> Result<()> {
        if msg.header.op != CONN_CHECK {
            return Err(EngineError::invalid("unexpected opcode in connection check"));
        }
        if msg.rendezvous {
            return Err(EngineError::invalid(
                "connection check must use the eager protocol",
            ));
        }
        let agent = std::str::from_utf8(msg.payload)
            .map_err(|_| EngineError::invalid("connection check carries a malformed agent name"))?;

        let conns = self.conns.read();
        match conns.get(agent) {
            Some(conn) => {
                let mut state = conn.state.lock();
                if *state != ConnState::Closed {
                    *state = ConnState::Established;
                }
                Ok(())
            }
            None => Err(EngineError::not_found(format!(
                "connection check from unknown agent {agent}"
            ))),
        }
    }

    fn on_disconnect(&self, msg: crate::fabric::AmRecv<'_>) -> Result<()> {
        if msg.header.op != DISCONNECT {
            return Err(EngineError::invalid("unexpected opcode in disconnect"));
        }
        if msg.rendezvous {
            return Err(EngineError::invalid("disconnect must use the eager protocol"));
        }
        // Teardown stays on the initiating side; requests may still
        // reference our endpoints.
        if let Ok(agent) = std::str::from_utf8(msg.payload) {
            debug!("peer {agent} announced disconnect");
        }
        Ok(())
    }

    fn on_notif(&self, msg: crate::fabric::AmRecv<'_>) -> Result<()> {
        if msg.header.op != NOTIF_STR {
            return Err(EngineError::invalid("unexpected opcode in notification"));
        }
        if msg.rendezvous {
            return Err(EngineError::invalid(
                "notifications must use the eager protocol",
            ));
        }

        let tags = TagDecoder::parse(msg.payload)?;
        let name = tags
            .get_str(TAG_NAME)
            .ok_or_else(|| EngineError::invalid("notification lacks a sender name"))?;
        let payload = tags
            .get(TAG_MSG)
            .ok_or_else(|| EngineError::invalid("notification lacks a message"))?;

        let notif = Notification {
            agent: name.to_string(),
            payload: payload.to_vec(),
        };
        if self.is_progress_thread() {
            self.notif_pthr_private.lock().push(notif);
        } else {
            self.notif_main.lock().push(notif);
        }
        Ok(())
    }

    fn is_progress_thread(&self) -> bool {
        *self.pthr.thread_id.read() == Some(thread::current().id())
    }

    /// Moves progress-thread staged notifications onto the shared list.
    fn notif_progress(&self) {
        let mut private = self.notif_pthr_private.lock();
        if private.is_empty() {
            return;
        }
        self.notif_pthr_shared.lock().append(&mut private);
    }

    fn worker_id_for_caller(&self) -> usize {
        let mut hasher = DefaultHasher::new();
        thread::current().id().hash(&mut hasher);
        (hasher.finish() as usize) % self.workers.len()
    }

    fn lookup_conn(&self, remote_agent: &str) -> Result<Arc<Connection>> {
        self.conns
            .read()
            .get(remote_agent)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("remote agent {remote_agent}")))
    }

    fn load_conn_info(&self, remote_agent: &str, blob: &[u8]) -> Result<()> {
        {
            let conns = self.conns.read();
            if conns.contains_key(remote_agent) {
                return Err(EngineError::invalid(format!(
                    "connection info for {remote_agent} already loaded"
                )));
            }
        }

        let mut eps = Vec::with_capacity(self.workers.len());
        for worker in &self.workers {
            match worker.connect(blob) {
                Ok(ep) => eps.push(ep),
                Err(err) => {
                    // Partially created endpoints unwind with the vector.
                    return Err(EngineError::backend(format!(
                        "endpoint setup for {remote_agent} failed: {err}"
                    )));
                }
            }
        }

        let conn = Arc::new(Connection {
            remote_agent: remote_agent.to_string(),
            eps,
            state: Mutex::new(ConnState::Fresh),
        });
        self.conns
            .write()
            .insert(remote_agent.to_string(), conn);
        Ok(())
    }

    fn send_conn_checks(&self, conn: &Connection) -> Result<()> {
        let mut pending: Vec<(usize, ReqToken)> = Vec::with_capacity(self.workers.len());
        let mut failure: Option<EngineError> = None;

        for (idx, worker) in self.workers.iter().enumerate() {
            let res = worker.send_am(
                &conn.eps[idx],
                CONN_CHECK,
                self.local_agent.as_bytes().to_vec(),
                AM_FLAG_EAGER,
            );
            match res {
                Ok(OpStatus::Completed) => {}
                Ok(OpStatus::Pending(tok)) => pending.push((idx, tok)),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        for (idx, tok) in pending {
            let worker = &self.workers[idx];
            loop {
                match worker.test(tok) {
                    Ok(XferStatus::Done) => {
                        worker.req_release(tok);
                        break;
                    }
                    Ok(XferStatus::InProgress) => {}
                    Err(err) => {
                        worker.req_release(tok);
                        if failure.is_none() {
                            failure = Some(err);
                        }
                        break;
                    }
                }
            }
        }

        match failure {
            None => Ok(()),
            Some(err) => Err(EngineError::backend(format!(
                "connection check to {} failed: {err}",
                conn.remote_agent
            ))),
        }
    }

    fn end_conn(&self, remote_agent: &str) -> Result<()> {
        let removed = self.conns.write().remove(remote_agent);
        match removed {
            Some(conn) => {
                *conn.state.lock() = ConnState::Closed;
                Ok(())
            }
            None => Err(EngineError::not_found(format!("remote agent {remote_agent}"))),
        }
    }

    fn import_remote_reg(&self, blob: &[u8], remote_agent: &str) -> Result<Registration> {
        let conn = self.lookup_conn(remote_agent)?;
        let mut rkeys = Vec::with_capacity(self.workers.len());
        for (idx, worker) in self.workers.iter().enumerate() {
            let rkey = worker
                .import_rkey(&conn.eps[idx], blob)
                .map_err(|err| EngineError::backend(format!("rkey import failed: {err}")))?;
            rkeys.push(rkey);
        }
        Ok(Registration::new(RdmaRemoteReg { conn, rkeys }))
    }

    fn notif_send(&self, remote_agent: &str, payload: &[u8], worker_id: usize) -> Result<OpStatus> {
        let conn = self.lookup_conn(remote_agent)?;
        let mut enc = TagEncoder::new();
        enc.add(TAG_NAME, self.local_agent.as_bytes());
        enc.add(TAG_MSG, payload);

        self.workers[worker_id].send_am(
            &conn.eps[worker_id],
            NOTIF_STR,
            enc.finish(),
            AM_FLAG_EAGER,
        )
    }

    fn release_chain(&self, xfer: &mut RdmaXfer) {
        let worker = &self.workers[xfer.worker_id];
        while let Some(tok) = xfer.chain.pop_front() {
            if !tok.is_complete() {
                worker.req_cancel(tok);
            }
            worker.req_release(tok);
        }
    }

    /// Appends a pending sub-operation to the chain; on dispatch error the
    /// whole chain is torn down.
    fn track_op(
        &self,
        xfer: &mut RdmaXfer,
        res: Result<OpStatus>,
    ) -> Result<()> {
        match res {
            Ok(OpStatus::Pending(tok)) => {
                xfer.chain.push_back(tok);
                Ok(())
            }
            Ok(OpStatus::Completed) => Ok(()),
            Err(err) => {
                self.release_chain(xfer);
                Err(err)
            }
        }
    }

    fn handle_status(&self, xfer: &mut RdmaXfer) -> Result<XferStatus> {
        if let Some(err) = &xfer.latched {
            return Err(err.clone());
        }

        let worker = &self.workers[xfer.worker_id];
        let mut first_err: Option<EngineError> = None;
        xfer.chain.for_each(|tok| {
            if first_err.is_some() || tok.is_complete() {
                return;
            }
            if let Err(err) = worker.test(tok) {
                first_err = Some(err);
            }
        });

        if let Some(err) = first_err {
            let err = EngineError::backend(format!("transfer sub-operation failed: {err}"));
            xfer.latched = Some(err.clone());
            return Err(err);
        }

        xfer.chain.retain(|tok| {
            if tok.is_complete() {
                worker.req_release(tok);
                false
            } else {
                true
            }
        });

        if xfer.chain.is_empty() {
            Ok(XferStatus::Done)
        } else {
            Ok(XferStatus::InProgress)
        }
    }

    fn progress_all(&self) -> usize {
        self.workers.iter().map(|worker| worker.progress()).sum()
    }

    fn progress_thread_start(inner: &Arc<Self>) {
        inner.pthr.stop.store(false, Ordering::Release);
        if !inner.pthr.enabled {
            return;
        }

        let thread_inner = Arc::clone(inner);
        let handle = thread::Builder::new()
            .name("nixl-rdma-progress".to_string())
            .spawn(move || thread_inner.progress_func())
            .expect("spawning the progress thread cannot fail with a valid name");
        *inner.pthr.handle.lock() = Some(handle);

        let mut active = inner.pthr.active.lock();
        while !*active {
            inner.pthr.active_cv.wait(&mut active);
        }
    }

    fn progress_func(&self) {
        self.device.lock().apply();
        *self.pthr.thread_id.write() = Some(thread::current().id());
        {
            let mut active = self.pthr.active.lock();
            *active = true;
            self.pthr.active_cv.notify_one();
        }

        while !self.pthr.stop.load(Ordering::Acquire) {
            let mut made_progress = false;
            for worker in &self.workers {
                while worker.progress() > 0 {
                    made_progress = true;
                }
            }
            if made_progress {
                self.notif_progress();
                continue;
            }

            loop {
                let all_armed = self.workers.iter().all(|worker| worker.arm());
                if !all_armed || self.pthr.stop.load(Ordering::Acquire) {
                    break;
                }
                if self.ctx.wait_event(self.pthr.delay) {
                    for worker in &self.workers {
                        while worker.progress() > 0 {}
                    }
                    self.notif_progress();
                }
            }
        }

        *self.pthr.thread_id.write() = None;
        let mut active = self.pthr.active.lock();
        *active = false;
    }

    fn progress_thread_stop(&self) {
        if !self.pthr.enabled {
            return;
        }
        let handle = self.pthr.handle.lock().take();
        if let Some(handle) = handle {
            self.pthr.stop.store(true, Ordering::Release);
            self.ctx.wake();
            if handle.join().is_err() {
                warn!("progress thread terminated abnormally");
            }
        }
    }

    fn progress_thread_restart(inner: &Arc<Self>) {
        inner.progress_thread_stop();
        Self::progress_thread_start(inner);
    }
}

fn check_kinds(local: &MetaDescList, remote: &MetaDescList) -> Result<()> {
    for kind in [local.kind(), remote.kind()] {
        if !matches!(kind, MemKind::HostDram | MemKind::DeviceDram) {
            return Err(EngineError::invalid(format!(
                "memory kind {kind:?} is not served by this engine"
            )));
        }
    }
    Ok(())
}

impl BackendEngine for RdmaEngine {
    fn supports_remote(&self) -> bool {
        true
    }

    fn supports_local(&self) -> bool {
        true
    }

    fn supports_notifications(&self) -> bool {
        true
    }

    fn supports_progress_thread(&self) -> bool {
        true
    }

    fn supported_memory_kinds(&self) -> Vec<MemKind> {
        vec![MemKind::HostDram, MemKind::DeviceDram]
    }

    fn register_memory(&self, desc: &RegDesc, kind: MemKind) -> Result<Registration> {
        match kind {
            MemKind::HostDram => {}
            MemKind::DeviceDram => {
                let restart = self.inner.device.lock().update(desc.addr, desc.dev_id)?;
                if restart {
                    EngineInner::progress_thread_restart(&self.inner);
                }
            }
            other => {
                return Err(EngineError::unsupported(format!(
                    "memory kind {other:?}"
                )))
            }
        }

        let mem = self.inner.ctx.register_memory(desc.addr, desc.len)?;
        let packed_key = mem.pack_key();
        Ok(Registration::new(RdmaLocalReg { mem, packed_key }))
    }

    fn deregister_memory(&self, reg: Registration) -> Result<()> {
        if reg.downcast::<RdmaLocalReg>().is_none() {
            return Err(EngineError::invalid(
                "registration does not belong to this engine",
            ));
        }
        Ok(())
    }

    fn connect(&self, remote_agent: &str) -> Result<()> {
        if remote_agent == self.inner.local_agent {
            let blob = self.inner.conn_blob.clone();
            return self.inner.load_conn_info(remote_agent, &blob);
        }

        let conn = self.inner.lookup_conn(remote_agent)?;
        self.inner.send_conn_checks(&conn)?;

        let mut state = conn.state.lock();
        if *state == ConnState::Fresh {
            *state = ConnState::CheckSent;
        }
        Ok(())
    }

    fn disconnect(&self, remote_agent: &str) -> Result<()> {
        if remote_agent != self.inner.local_agent {
            let conn = self.inner.lookup_conn(remote_agent)?;
            for (idx, worker) in self.inner.workers.iter().enumerate() {
                let sent = worker.send_am(
                    &conn.eps[idx],
                    DISCONNECT,
                    self.inner.local_agent.as_bytes().to_vec(),
                    AM_FLAG_EAGER,
                );
                match sent {
                    // Fire and forget; the slot is reclaimed after delivery.
                    Ok(OpStatus::Pending(tok)) => worker.req_release(tok),
                    Ok(OpStatus::Completed) => {}
                    Err(err) => warn!("disconnect message to {remote_agent} failed: {err}"),
                }
            }
        }

        if let Err(err) = self.inner.end_conn(remote_agent) {
            debug!("disconnect without a loaded connection: {err}");
        }
        Ok(())
    }

    fn connection_info(&self) -> Result<Vec<u8>> {
        Ok(self.inner.conn_blob.to_vec())
    }

    fn load_remote_connection_info(&self, remote_agent: &str, blob: &[u8]) -> Result<()> {
        self.inner.load_conn_info(remote_agent, blob)
    }

    fn public_metadata(&self, reg: &Registration) -> Result<Vec<u8>> {
        let local = reg
            .downcast::<RdmaLocalReg>()
            .ok_or_else(|| EngineError::invalid("registration has no public metadata"))?;
        Ok(local.packed_key.to_vec())
    }

    fn load_remote_metadata(
        &self,
        blob: &[u8],
        _kind: MemKind,
        remote_agent: &str,
    ) -> Result<Registration> {
        self.inner.import_remote_reg(blob, remote_agent)
    }

    fn load_local_metadata(&self, reg: &Registration) -> Result<Registration> {
        let local = reg
            .downcast::<RdmaLocalReg>()
            .ok_or_else(|| EngineError::invalid("not a local registration of this engine"))?;
        let blob = local.packed_key.clone();
        self.inner.import_remote_reg(&blob, &self.inner.local_agent)
    }

    fn unload_metadata(&self, reg: Registration) -> Result<()> {
        if reg.downcast::<RdmaRemoteReg>().is_none() {
            return Err(EngineError::invalid(
                "handle is not loaded remote metadata",
            ));
        }
        Ok(())
    }

    fn prep_transfer(
        &self,
        _op: XferOp,
        local: &MetaDescList,
        remote: &MetaDescList,
        _remote_agent: &str,
    ) -> Result<XferHandle> {
        check_kinds(local, remote)?;
        Ok(XferHandle::new(RdmaXfer {
            chain: ReqList::new(),
            worker_id: self.inner.worker_id_for_caller(),
            posted: false,
            latched: None,
        }))
    }

    fn post_transfer(
        &self,
        op: XferOp,
        local: &MetaDescList,
        remote: &MetaDescList,
        remote_agent: &str,
        handle: &mut XferHandle,
        opts: &XferOptions,
    ) -> Result<XferStatus> {
        check_kinds(local, remote)?;
        if local.len() != remote.len() {
            return Err(EngineError::invalid("descriptor count mismatch"));
        }

        let inner = Arc::clone(&self.inner);
        let xfer = handle
            .downcast_mut::<RdmaXfer>()
            .ok_or_else(|| EngineError::invalid("foreign transfer handle"))?;
        if xfer.posted {
            return Err(EngineError::invalid("transfer handle was already posted"));
        }
        if local.is_empty() {
            xfer.posted = true;
            return Ok(XferStatus::Done);
        }
        xfer.posted = true;

        let worker_id = xfer.worker_id;
        let worker = &inner.workers[worker_id];

        for idx in 0..local.len() {
            let ldesc = &local[idx];
            let rdesc = &remote[idx];
            if ldesc.len != rdesc.len {
                return Err(EngineError::invalid(format!(
                    "descriptor {idx} length mismatch: local {} vs remote {}",
                    ldesc.len, rdesc.len
                )));
            }

            let lmd = ldesc
                .meta
                .downcast::<RdmaLocalReg>()
                .ok_or_else(|| EngineError::invalid("local descriptor lacks a registration"))?;
            let rmd = rdesc
                .meta
                .downcast::<RdmaRemoteReg>()
                .ok_or_else(|| {
                    EngineError::invalid("remote descriptor lacks imported metadata")
                })?;

            let ep = &rmd.conn.eps[worker_id];
            let rkey = &rmd.rkeys[worker_id];
            let res = match op {
                XferOp::Read => worker.read(
                    ep,
                    rdesc.addr,
                    rkey,
                    ldesc.addr,
                    &lmd.mem,
                    ldesc.len as usize,
                ),
                XferOp::Write => worker.write(
                    ep,
                    ldesc.addr,
                    &lmd.mem,
                    rdesc.addr,
                    rkey,
                    ldesc.len as usize,
                ),
            };
            inner.track_op(xfer, res)?;
        }

        // Barrier: its completion implies all one-sided ops above reached
        // their targets.
        let rmd0 = remote[0]
            .meta
            .downcast::<RdmaRemoteReg>()
            .ok_or_else(|| EngineError::invalid("remote descriptor lacks imported metadata"))?;
        let res = worker.flush(&rmd0.conn.eps[worker_id]);
        inner.track_op(xfer, res)?;

        if let Some(payload) = &opts.notification {
            let res = inner.notif_send(remote_agent, payload, worker_id);
            inner.track_op(xfer, res)?;
        }

        inner.handle_status(xfer)
    }

    fn check_transfer(&self, handle: &mut XferHandle) -> Result<XferStatus> {
        let inner = Arc::clone(&self.inner);
        let xfer = handle
            .downcast_mut::<RdmaXfer>()
            .ok_or_else(|| EngineError::invalid("foreign transfer handle"))?;
        inner.handle_status(xfer)
    }

    fn release_transfer(&self, handle: XferHandle) -> Result<()> {
        let mut xfer = handle
            .into_inner::<RdmaXfer>()
            .ok_or_else(|| EngineError::invalid("foreign transfer handle"))?;
        self.inner.release_chain(&mut xfer);
        Ok(())
    }

    fn progress(&self) -> usize {
        self.inner.progress_all()
    }

    fn get_notifications(&self, out: &mut NotifList) -> Result<()> {
        if !out.is_empty() {
            return Err(EngineError::invalid("notification list must be empty"));
        }

        if !self.inner.pthr.enabled {
            while self.inner.progress_all() > 0 {}
        }

        out.append(&mut self.inner.notif_main.lock());
        out.append(&mut self.inner.notif_pthr_shared.lock());
        Ok(())
    }

    fn generate_notification(&self, remote_agent: &str, payload: &[u8]) -> Result<()> {
        let worker_id = self.inner.worker_id_for_caller();
        match self.inner.notif_send(remote_agent, payload, worker_id)? {
            // Untracked: the fabric reclaims the slot once it settles.
            OpStatus::Pending(tok) => self.inner.workers[worker_id].req_release(tok),
            OpStatus::Completed => {}
        }
        Ok(())
    }
}
