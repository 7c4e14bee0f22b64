pub mod chain;
pub mod device;
pub mod engine;
pub mod fabric;

pub use device::{DevicePtrInfo, DeviceQuery, HostOnlyQuery};
pub use engine::RdmaEngine;
