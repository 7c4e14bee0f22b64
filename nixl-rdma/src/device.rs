//! Device-memory context tracking for the RDMA engine.
//!
//! The progress thread can only serve device memory after it has bound the
//! owning device context, so the first device registration is remembered and
//! reported as requiring a thread restart. Concrete device-runtime bindings
//! stay outside this crate; the engine consumes them through [`DeviceQuery`].

use std::sync::Arc;

use log::{debug, warn};

use nixl_core::{EngineError, Result};

/// Presence of this variable (any value) disables context tracking.
pub const DISABLE_DEVICE_CTX_ENV: &str = "NIXL_DISABLE_CUDA_ADDR_WA";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DevicePtrInfo {
    pub device: u64,
    pub context: u64,
}

/// Classifies a pointer: `None` for host memory, device/context otherwise.
pub trait DeviceQuery: Send + Sync {
    fn query(&self, addr: u64) -> Option<DevicePtrInfo>;
}

/// Default query for builds without a device runtime: everything is host
/// memory.
pub struct HostOnlyQuery;

impl DeviceQuery for HostOnlyQuery {
    fn query(&self, _addr: u64) -> Option<DevicePtrInfo> {
        None
    }
}

pub(crate) struct DeviceCtxTracker {
    enabled: bool,
    query: Arc<dyn DeviceQuery>,
    context: Option<u64>,
    device: Option<u64>,
}

impl DeviceCtxTracker {
    pub fn from_env(query: Arc<dyn DeviceQuery>) -> Self {
        let disabled = std::env::var_os(DISABLE_DEVICE_CTX_ENV).is_some();
        if disabled {
            warn!("device context tracking disabled via {DISABLE_DEVICE_CTX_ENV}");
        }
        Self::with_enabled(query, !disabled)
    }

    pub fn with_enabled(query: Arc<dyn DeviceQuery>, enabled: bool) -> Self {
        Self {
            enabled,
            query,
            context: None,
            device: None,
        }
    }

    /// Inspects a device registration. Returns whether the progress thread
    /// must be restarted to inherit a freshly adopted context.
    pub fn update(&mut self, addr: u64, expected_dev: u64) -> Result<bool> {
        if !self.enabled {
            return Ok(false);
        }

        if let Some(dev) = self.device {
            if dev != expected_dev {
                return Err(EngineError::unsupported(format!(
                    "device {expected_dev} differs from the engine's adopted device {dev}"
                )));
            }
        }

        let Some(info) = self.query.query(addr) else {
            // Host pointer; nothing to track.
            return Ok(false);
        };

        if info.device != expected_dev {
            return Err(EngineError::unsupported(format!(
                "pointer {addr:#x} belongs to device {}, descriptor names device {expected_dev}",
                info.device
            )));
        }

        match self.context {
            Some(ctx) if ctx != info.context => Err(EngineError::unsupported(
                "device context differs from the context adopted at first registration",
            )),
            Some(_) => Ok(false),
            None => {
                self.context = Some(info.context);
                self.device = Some(expected_dev);
                Ok(true)
            }
        }
    }

    /// Binds the adopted context to the calling thread. Hook for the
    /// progress thread; a no-op until a context has been adopted.
    pub fn apply(&self) {
        if let Some(ctx) = self.context {
            debug!("progress thread inheriting device context {ctx:#x}");
        }
    }
}
