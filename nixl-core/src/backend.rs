//! The engine-agnostic backend contract.
//!
//! A backend engine moves bytes between memory segments through a fixed
//! lifecycle: register memory, prepare a transfer, post it, poll it to
//! completion, release it. Connection bootstrap and metadata exchange are
//! opaque byte blobs the agent layer ships between peers.

use std::collections::HashMap;

use crate::error::{EngineError, Result, XferStatus};
use crate::types::{MemKind, MetaDescList, NotifList, RegDesc, Registration, XferHandle, XferOp};

/// Construction parameters common to all engines plus the engine-specific
/// `custom` string map.
#[derive(Clone, Debug)]
pub struct BackendParams {
    pub local_agent: String,
    pub num_workers: usize,
    pub enable_progress_thread: bool,
    /// Poll timeout in milliseconds used by the progress thread when idle.
    pub progress_delay_ms: u64,
    pub custom: HashMap<String, String>,
}

impl Default for BackendParams {
    fn default() -> Self {
        Self {
            local_agent: String::new(),
            num_workers: 1,
            enable_progress_thread: false,
            progress_delay_ms: 100,
            custom: HashMap::new(),
        }
    }
}

impl BackendParams {
    pub fn new(local_agent: impl Into<String>) -> Self {
        Self {
            local_agent: local_agent.into(),
            ..Self::default()
        }
    }

    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_progress_thread(mut self, delay_ms: u64) -> Self {
        self.enable_progress_thread = true;
        self.progress_delay_ms = delay_ms;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom.insert(key.into(), value.into());
        self
    }
}

/// Per-post options. A set notification is delivered to the remote agent
/// after the transfer's data has been flushed.
#[derive(Clone, Debug, Default)]
pub struct XferOptions {
    pub notification: Option<Vec<u8>>,
}

impl XferOptions {
    pub fn with_notification(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            notification: Some(payload.into()),
        }
    }
}

/// Contract implemented by every backend engine.
///
/// Capability accessors are constant over the engine's lifetime. Operations
/// on one transfer handle must not race each other; distinct handles may be
/// driven from distinct threads freely.
pub trait BackendEngine: Send + Sync {
    fn supports_remote(&self) -> bool;
    fn supports_local(&self) -> bool;
    fn supports_notifications(&self) -> bool;
    fn supports_progress_thread(&self) -> bool;

    fn supported_memory_kinds(&self) -> Vec<MemKind>;

    /// Registers a memory segment. The returned handle is valid until
    /// `deregister_memory`.
    fn register_memory(&self, desc: &RegDesc, kind: MemKind) -> Result<Registration>;
    fn deregister_memory(&self, reg: Registration) -> Result<()>;

    /// No-ops for local-only engines.
    fn connect(&self, remote_agent: &str) -> Result<()> {
        let _ = remote_agent;
        Ok(())
    }

    fn disconnect(&self, remote_agent: &str) -> Result<()> {
        let _ = remote_agent;
        Ok(())
    }

    /// Opaque bootstrap blob handed to peers out of band.
    fn connection_info(&self) -> Result<Vec<u8>> {
        Err(EngineError::unsupported("connection info"))
    }

    fn load_remote_connection_info(&self, remote_agent: &str, blob: &[u8]) -> Result<()> {
        let _ = (remote_agent, blob);
        Err(EngineError::unsupported("remote connection info"))
    }

    /// Public half of a registration, shipped to peers by the agent. Only
    /// meaningful for remote-capable engines.
    fn public_metadata(&self, reg: &Registration) -> Result<Vec<u8>> {
        let _ = reg;
        Err(EngineError::unsupported("public metadata"))
    }

    fn load_remote_metadata(
        &self,
        blob: &[u8],
        kind: MemKind,
        remote_agent: &str,
    ) -> Result<Registration> {
        let _ = (blob, kind, remote_agent);
        Err(EngineError::unsupported("remote metadata"))
    }

    /// Loopback path: resolve a local registration into the form transfers
    /// consume when source and target share this agent.
    fn load_local_metadata(&self, reg: &Registration) -> Result<Registration>;

    fn unload_metadata(&self, reg: Registration) -> Result<()> {
        let _ = reg;
        Ok(())
    }

    fn prep_transfer(
        &self,
        op: XferOp,
        local: &MetaDescList,
        remote: &MetaDescList,
        remote_agent: &str,
    ) -> Result<XferHandle>;

    /// Begins asynchronous work. `Ok(InProgress)` while sub-operations
    /// remain, `Ok(Done)` if everything completed synchronously.
    fn post_transfer(
        &self,
        op: XferOp,
        local: &MetaDescList,
        remote: &MetaDescList,
        remote_agent: &str,
        handle: &mut XferHandle,
        opts: &XferOptions,
    ) -> Result<XferStatus>;

    /// Non-blocking poll; monotonic per handle. A latched error stays until
    /// the handle is released.
    fn check_transfer(&self, handle: &mut XferHandle) -> Result<XferStatus>;

    /// Cancels pending sub-operations and reclaims the handle. Valid at any
    /// point after `prep_transfer`.
    fn release_transfer(&self, handle: XferHandle) -> Result<()>;

    /// Drives all workers once; the caller's substitute for the progress
    /// thread. Returns the number of progressed events.
    fn progress(&self) -> usize {
        0
    }

    /// Drains pending notifications into `out`, which must be empty.
    fn get_notifications(&self, out: &mut NotifList) -> Result<()> {
        let _ = out;
        Err(EngineError::unsupported("notifications"))
    }

    fn generate_notification(&self, remote_agent: &str, payload: &[u8]) -> Result<()> {
        let _ = (remote_agent, payload);
        Err(EngineError::unsupported("notifications"))
    }
}
