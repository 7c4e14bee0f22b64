//! Fixed-size cooperative thread pool running the object engine's I/O and
//! completion callbacks.
//!
//! `submit` never blocks; tasks are picked up in FIFO order by whichever
//! worker is free. `wait_until_stopped` must run before anything captured by
//! in-flight tasks is torn down, which is why the engine calls it on drop.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};
use log::warn;
use parking_lot::{Condvar, Mutex};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Inflight {
    count: Mutex<usize>,
    idle_cv: Condvar,
}

impl Inflight {
    fn started(&self) {
        *self.count.lock() += 1;
    }

    fn finished(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count == 0 {
            self.idle_cv.notify_all();
        }
    }
}

pub struct ThreadPoolExecutor {
    tx: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    inflight: Arc<Inflight>,
}

impl ThreadPoolExecutor {
    pub fn new(threads: usize) -> Arc<Self> {
        let threads = threads.max(1);
        let (tx, rx) = channel::unbounded::<Job>();
        let inflight = Arc::new(Inflight::default());

        let workers = (0..threads)
            .map(|idx| {
                let rx = rx.clone();
                let inflight = Arc::clone(&inflight);
                thread::Builder::new()
                    .name(format!("nixl-obj-worker-{idx}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            job();
                            inflight.finished();
                        }
                    })
                    .expect("spawning a pool worker cannot fail with a valid name")
            })
            .collect();

        Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            inflight,
        })
    }

    pub fn with_default_parallelism() -> Arc<Self> {
        let threads = thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1);
        Self::new(threads)
    }

    /// Queues a task without blocking. After `wait_until_stopped` the task
    /// runs inline so no completion is ever abandoned.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        let job: Job = Box::new(job);
        let sent = {
            let tx = self.tx.lock();
            match tx.as_ref() {
                Some(tx) => {
                    self.inflight.started();
                    match tx.send(job) {
                        Ok(()) => Ok(()),
                        Err(err) => {
                            self.inflight.finished();
                            Err(err.into_inner())
                        }
                    }
                }
                None => Err(job),
            }
        };
        if let Err(job) = sent {
            warn!("executor is stopped; running task on the caller");
            job();
        }
    }

    /// Blocks until every submitted task has finished.
    pub fn wait_until_idle(&self) {
        let mut count = self.inflight.count.lock();
        while *count > 0 {
            self.inflight.idle_cv.wait(&mut count);
        }
    }

    /// Drains the queue and joins all workers. Idempotent.
    pub fn wait_until_stopped(&self) {
        drop(self.tx.lock().take());
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                warn!("pool worker terminated abnormally");
            }
        }
    }
}

impl Drop for ThreadPoolExecutor {
    fn drop(&mut self) {
        self.wait_until_stopped();
    }
}
