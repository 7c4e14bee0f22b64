#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use nixl_obj::{ObjCallback, ObjectClient, ThreadPoolExecutor};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedOp {
    pub key: String,
    pub len: usize,
    pub offset: u64,
}

/// Test double for the object store: records every operation and holds the
/// completion callbacks until the test chooses to run them.
pub struct MockObjectClient {
    success: Arc<AtomicBool>,
    executor: Mutex<Option<Arc<ThreadPoolExecutor>>>,
    pending: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    pub puts: Mutex<Vec<RecordedOp>>,
    pub gets: Mutex<Vec<RecordedOp>>,
}

impl MockObjectClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            success: Arc::new(AtomicBool::new(true)),
            executor: Mutex::new(None),
            pending: Mutex::new(Vec::new()),
            puts: Mutex::new(Vec::new()),
            gets: Mutex::new(Vec::new()),
        })
    }

    pub fn set_simulate_success(&self, success: bool) {
        self.success.store(success, Ordering::SeqCst);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn has_executor(&self) -> bool {
        self.executor.lock().is_some()
    }

    /// Runs the held callbacks on the engine's executor and waits for them.
    pub fn exec_async(&self) {
        let executor = self
            .executor
            .lock()
            .clone()
            .expect("engine must have installed an executor");
        for callback in self.pending.lock().drain(..) {
            executor.submit(callback);
        }
        executor.wait_until_idle();
    }
}

impl ObjectClient for MockObjectClient {
    fn set_executor(&self, executor: Arc<ThreadPoolExecutor>) {
        *self.executor.lock() = Some(executor);
    }

    fn put_async(&self, key: &str, _data_ptr: u64, data_len: usize, offset: u64, cb: ObjCallback) {
        self.puts.lock().push(RecordedOp {
            key: key.to_string(),
            len: data_len,
            offset,
        });
        // Like the real store: no partial PUT.
        if offset != 0 {
            cb(false);
            return;
        }
        let success = Arc::clone(&self.success);
        self.pending
            .lock()
            .push(Box::new(move || cb(success.load(Ordering::SeqCst))));
    }

    fn get_async(&self, key: &str, data_ptr: u64, data_len: usize, offset: u64, cb: ObjCallback) {
        self.gets.lock().push(RecordedOp {
            key: key.to_string(),
            len: data_len,
            offset,
        });
        let success = Arc::clone(&self.success);
        self.pending.lock().push(Box::new(move || {
            let ok = success.load(Ordering::SeqCst);
            if ok && data_ptr != 0 && data_len > 0 {
                let buffer =
                    unsafe { std::slice::from_raw_parts_mut(data_ptr as *mut u8, data_len) };
                for (idx, byte) in buffer.iter_mut().enumerate() {
                    *byte = b'A' + (idx % 26) as u8;
                }
            }
            cb(ok);
        }));
    }
}
