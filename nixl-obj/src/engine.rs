//! Object-storage backend engine.
//!
//! Treats a key-addressed object store as a remote memory segment: an
//! `Object` registration binds a device id to an object key, and each
//! posted descriptor pair becomes one async PUT or GET whose completion is
//! observed through the transfer handle. The engine is local-only: the
//! remote agent of every transfer must be this agent.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam::channel::{self, Receiver, TryRecvError};
use log::{error, info};
use parking_lot::Mutex;

use nixl_core::{
    logging, BackendEngine, BackendParams, EngineError, MemKind, MetaDescList, RegDesc,
    Registration, Result, XferHandle, XferOp, XferOptions, XferStatus,
};

use crate::client::{ObjectClient, S3ObjectClient};
use crate::executor::ThreadPoolExecutor;

struct ObjReg {
    kind: MemKind,
    dev_id: u64,
    obj_key: String,
}

/// Single-use completion slot; the dispatch closure owns the sending half,
/// so a released handle leaves callbacks writing into an orphaned slot.
struct StatusFuture {
    rx: Receiver<bool>,
}

enum FuturePoll {
    Ready(bool),
    NotReady,
    Abandoned,
}

impl StatusFuture {
    fn poll(&self) -> FuturePoll {
        match self.rx.try_recv() {
            Ok(ok) => FuturePoll::Ready(ok),
            Err(TryRecvError::Empty) => FuturePoll::NotReady,
            Err(TryRecvError::Disconnected) => FuturePoll::Abandoned,
        }
    }
}

struct ObjXfer {
    futures: Vec<StatusFuture>,
    posted: bool,
    latched: Option<EngineError>,
}

pub struct ObjEngine {
    local_agent: String,
    executor: Arc<ThreadPoolExecutor>,
    client: Arc<dyn ObjectClient>,
    keys: Mutex<HashMap<u64, String>>,
}

impl ObjEngine {
    pub fn new(params: &BackendParams) -> Result<Self> {
        logging::ensure_initialized();
        let executor = ThreadPoolExecutor::with_default_parallelism();
        let client = Arc::new(S3ObjectClient::from_params(
            &params.custom,
            Arc::clone(&executor),
        )?);
        info!("object engine initialized for agent {}", params.local_agent);
        Ok(Self {
            local_agent: params.local_agent.clone(),
            executor,
            client,
            keys: Mutex::new(HashMap::new()),
        })
    }

    /// Builds the engine around an injected client; the engine owns the
    /// executor and hands it to the client.
    pub fn with_client(params: &BackendParams, client: Arc<dyn ObjectClient>) -> Self {
        logging::ensure_initialized();
        let executor = ThreadPoolExecutor::with_default_parallelism();
        client.set_executor(Arc::clone(&executor));
        info!(
            "object engine initialized with injected client for agent {}",
            params.local_agent
        );
        Self {
            local_agent: params.local_agent.clone(),
            executor,
            client,
            keys: Mutex::new(HashMap::new()),
        }
    }

    fn validate_lists(
        &self,
        local: &MetaDescList,
        remote: &MetaDescList,
        remote_agent: &str,
    ) -> Result<()> {
        if remote_agent != self.local_agent {
            error!(
                "remote agent must match the requesting agent ({}), got {remote_agent}",
                self.local_agent
            );
            return Err(EngineError::invalid("remote agent must be the local agent"));
        }
        if local.kind() != MemKind::HostDram {
            return Err(EngineError::invalid("local memory kind must be HostDram"));
        }
        if remote.kind() != MemKind::Object {
            return Err(EngineError::invalid("remote memory kind must be Object"));
        }
        Ok(())
    }

    fn object_key(&self, dev_id: u64) -> Result<String> {
        self.keys.lock().get(&dev_id).cloned().ok_or_else(|| {
            EngineError::invalid(format!("no object key registered for device id {dev_id}"))
        })
    }
}

impl Drop for ObjEngine {
    fn drop(&mut self) {
        // In-flight tasks capture the client and caller buffers; drain them
        // before teardown.
        self.executor.wait_until_stopped();
    }
}

impl BackendEngine for ObjEngine {
    fn supports_remote(&self) -> bool {
        false
    }

    fn supports_local(&self) -> bool {
        true
    }

    fn supports_notifications(&self) -> bool {
        false
    }

    fn supports_progress_thread(&self) -> bool {
        false
    }

    fn supported_memory_kinds(&self) -> Vec<MemKind> {
        vec![MemKind::Object, MemKind::HostDram]
    }

    fn register_memory(&self, desc: &RegDesc, kind: MemKind) -> Result<Registration> {
        match kind {
            MemKind::Object => {
                let obj_key = if desc.meta.is_empty() {
                    desc.dev_id.to_string()
                } else {
                    String::from_utf8(desc.meta.clone())
                        .map_err(|_| EngineError::invalid("object key is not valid UTF-8"))?
                };
                self.keys.lock().insert(desc.dev_id, obj_key.clone());
                Ok(Registration::new(ObjReg {
                    kind,
                    dev_id: desc.dev_id,
                    obj_key,
                }))
            }
            MemKind::HostDram => Ok(Registration::new(ObjReg {
                kind,
                dev_id: desc.dev_id,
                obj_key: String::new(),
            })),
            other => Err(EngineError::unsupported(format!("memory kind {other:?}"))),
        }
    }

    fn deregister_memory(&self, reg: Registration) -> Result<()> {
        let state = reg
            .downcast::<ObjReg>()
            .ok_or_else(|| EngineError::invalid("registration does not belong to this engine"))?;
        if state.kind == MemKind::Object {
            self.keys.lock().remove(&state.dev_id);
        }
        Ok(())
    }

    fn load_local_metadata(&self, reg: &Registration) -> Result<Registration> {
        if reg.downcast::<ObjReg>().is_none() {
            return Err(EngineError::invalid(
                "registration does not belong to this engine",
            ));
        }
        Ok(reg.clone())
    }

    fn prep_transfer(
        &self,
        _op: XferOp,
        local: &MetaDescList,
        remote: &MetaDescList,
        remote_agent: &str,
    ) -> Result<XferHandle> {
        self.validate_lists(local, remote, remote_agent)?;
        Ok(XferHandle::new(ObjXfer {
            futures: Vec::new(),
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
        _opts: &XferOptions,
    ) -> Result<XferStatus> {
        self.validate_lists(local, remote, remote_agent)?;
        if local.len() != remote.len() {
            return Err(EngineError::invalid("descriptor count mismatch"));
        }

        let xfer = handle
            .downcast_mut::<ObjXfer>()
            .ok_or_else(|| EngineError::invalid("foreign transfer handle"))?;
        if xfer.posted {
            return Err(EngineError::invalid("transfer handle was already posted"));
        }
        xfer.posted = true;

        for idx in 0..local.len() {
            let ldesc = &local[idx];
            let rdesc = &remote[idx];
            if ldesc.len != rdesc.len {
                return Err(EngineError::invalid(format!(
                    "descriptor {idx} length mismatch: local {} vs remote {}",
                    ldesc.len, rdesc.len
                )));
            }

            let key = self.object_key(rdesc.dev_id)?;
            let (tx, rx) = channel::bounded::<bool>(1);
            xfer.futures.push(StatusFuture { rx });

            let callback = Box::new(move |ok: bool| {
                // The handle may already be released; the orphaned slot
                // swallows the result.
                let _ = tx.send(ok);
            });

            // remote.addr is the byte offset within the object.
            match op {
                XferOp::Write => self.client.put_async(
                    &key,
                    ldesc.addr,
                    ldesc.len as usize,
                    rdesc.addr,
                    callback,
                ),
                XferOp::Read => self.client.get_async(
                    &key,
                    ldesc.addr,
                    ldesc.len as usize,
                    rdesc.addr,
                    callback,
                ),
            }
        }

        if xfer.futures.is_empty() {
            Ok(XferStatus::Done)
        } else {
            Ok(XferStatus::InProgress)
        }
    }

    fn check_transfer(&self, handle: &mut XferHandle) -> Result<XferStatus> {
        let xfer = handle
            .downcast_mut::<ObjXfer>()
            .ok_or_else(|| EngineError::invalid("foreign transfer handle"))?;
        if let Some(err) = &xfer.latched {
            return Err(err.clone());
        }

        while let Some(future) = xfer.futures.last() {
            match future.poll() {
                FuturePoll::Ready(true) => {
                    xfer.futures.pop();
                }
                FuturePoll::Ready(false) => {
                    let err = EngineError::backend("object operation failed");
                    xfer.latched = Some(err.clone());
                    xfer.futures.clear();
                    return Err(err);
                }
                FuturePoll::Abandoned => {
                    let err = EngineError::backend("object operation was abandoned");
                    xfer.latched = Some(err.clone());
                    xfer.futures.clear();
                    return Err(err);
                }
                FuturePoll::NotReady => return Ok(XferStatus::InProgress),
            }
        }
        Ok(XferStatus::Done)
    }

    fn release_transfer(&self, handle: XferHandle) -> Result<()> {
        // Dropping the futures orphans their promises; outstanding
        // callbacks finish harmlessly on the executor.
        handle
            .into_inner::<ObjXfer>()
            .ok_or_else(|| EngineError::invalid("foreign transfer handle"))?;
        Ok(())
    }
}
