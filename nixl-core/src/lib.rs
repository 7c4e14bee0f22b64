pub mod backend;
pub mod error;
pub mod logging;
pub mod serdes;
pub mod types;

pub use backend::{BackendEngine, BackendParams, XferOptions};
pub use error::{EngineError, Result, XferStatus};
pub use types::{
    MemKind, MetaDesc, MetaDescList, NotifList, Notification, RegDesc, Registration, XferHandle,
    XferOp,
};
