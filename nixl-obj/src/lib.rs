pub mod client;
pub mod engine;
pub mod executor;

pub use client::{ObjCallback, ObjectClient, S3ObjectClient};
pub use engine::ObjEngine;
pub use executor::ThreadPoolExecutor;
