//! Asynchronous joiner for finished session threads.
//!
//! `stop()` hands the session's `JoinHandle` to a single long-lived worker
//! over a bounded channel instead of joining on the caller's thread.
//! Shutdown closes the channel and waits until every queued handle has been
//! joined.

use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::metrics::EngineMetrics;

pub struct ThreadReaper {
    sender: Mutex<Option<Sender<JoinHandle<()>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<EngineMetrics>,
}

impl ThreadReaper {
    pub fn new(queue_capacity: usize, metrics: Arc<EngineMetrics>) -> Result<Self, EngineError> {
        let (tx, rx) = channel::bounded::<JoinHandle<()>>(queue_capacity.max(1));

        let worker_metrics = Arc::clone(&metrics);
        let worker = thread::Builder::new()
            .name("vs-reaper".into())
            .spawn(move || {
                debug!("Reaper thread started");
                for handle in rx.iter() {
                    join_one(handle, &worker_metrics);
                }
                debug!("Reaper thread exiting, queue drained");
            })
            .map_err(EngineError::Spawn)?;

        Ok(Self {
            sender: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            metrics,
        })
    }

    /// Queue a finished (or finishing) thread for joining.
    ///
    /// Blocks only if the queue is full. After shutdown the handle is joined
    /// on the caller's thread.
    pub fn submit(&self, handle: JoinHandle<()>) {
        let sender = self.sender.lock().clone();
        let rejected = match sender {
            Some(tx) => match tx.send(handle) {
                Ok(()) => return,
                Err(channel::SendError(handle)) => handle,
            },
            None => handle,
        };
        warn!("Reaper unavailable, joining session thread inline");
        join_one(rejected, &self.metrics);
    }

    /// Close the queue and wait for every queued thread to be joined.
    /// Calling it again is a no-op.
    pub fn shutdown(&self) {
        drop(self.sender.lock().take());
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                warn!("Reaper thread panicked");
            }
            info!(
                reaped = self.metrics.snapshot().threads_reaped,
                "Reaper shut down"
            );
        }
    }
}

impl Drop for ThreadReaper {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn join_one(handle: JoinHandle<()>, metrics: &EngineMetrics) {
    let name = handle.thread().name().map(str::to_owned);
    if handle.join().is_err() {
        warn!(thread = ?name, "Session thread panicked before exit");
    }
    metrics.thread_reaped();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_shutdown_drains_queue() {
        let metrics = Arc::new(EngineMetrics::new());
        let reaper = ThreadReaper::new(2, Arc::clone(&metrics)).unwrap();
        let finished = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let finished = Arc::clone(&finished);
            reaper.submit(thread::spawn(move || {
                thread::sleep(Duration::from_millis(5));
                finished.fetch_add(1, Ordering::SeqCst);
            }));
        }
        reaper.shutdown();

        assert_eq!(finished.load(Ordering::SeqCst), 10);
        assert_eq!(metrics.snapshot().threads_reaped, 10);
    }

    #[test]
    fn test_submit_after_shutdown_joins_inline() {
        let metrics = Arc::new(EngineMetrics::new());
        let reaper = ThreadReaper::new(4, Arc::clone(&metrics)).unwrap();
        reaper.shutdown();
        reaper.shutdown();

        reaper.submit(thread::spawn(|| {}));
        assert_eq!(metrics.snapshot().threads_reaped, 1);
    }

    #[test]
    fn test_panicked_thread_does_not_stop_worker() {
        let metrics = Arc::new(EngineMetrics::new());
        let reaper = ThreadReaper::new(4, Arc::clone(&metrics)).unwrap();

        reaper.submit(thread::spawn(|| panic!("session blew up")));
        reaper.submit(thread::spawn(|| {}));
        drop(reaper);

        assert_eq!(metrics.snapshot().threads_reaped, 2);
    }
}
