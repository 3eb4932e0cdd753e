//! Strict FIFO executor for document mutations.
//!
//! One worker thread drains a channel of boxed jobs, so no two queued
//! read-modify-write cycles ever interleave. The queue is shared by every
//! session the service touches: unrelated sessions are serialized too.
//!
//! ```text
//! enqueue(op) ──► [job, job, job] ──► worker ──► op() ──► QueuedWrite::wait()
//! ```

use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::error::{HistoryError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub submitted: u64,
    pub completed: u64,
    pub pending: u64,
}

pub struct WriteQueue {
    sender: Mutex<Option<Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    submitted: AtomicU64,
    completed: Arc<AtomicU64>,
}

/// Deferred result of one queued operation.
#[must_use = "a queued write reports its outcome only through wait()"]
pub struct QueuedWrite<T> {
    receiver: Receiver<Result<T>>,
}

impl<T> QueuedWrite<T> {
    /// Blocks until the operation has run and returns its own result.
    pub fn wait(self) -> Result<T> {
        self.receiver.recv().unwrap_or(Err(HistoryError::QueueClosed))
    }
}

impl Default for WriteQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let worker = thread::spawn(move || {
            for job in receiver {
                job();
            }
            tracing::debug!("Write queue worker stopped");
        });

        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            submitted: AtomicU64::new(0),
            completed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Queues `operation` behind everything submitted before it.
    pub fn enqueue<T, F>(&self, operation: F) -> QueuedWrite<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (result_tx, result_rx) = mpsc::channel();
        let completed = Arc::clone(&self.completed);

        let job: Job = Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(operation))
                .unwrap_or(Err(HistoryError::OperationPanicked));
            completed.fetch_add(1, Ordering::SeqCst);
            let _ = result_tx.send(result);
        });

        let accepted = self
            .sender
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|tx| tx.send(job).is_ok()))
            .unwrap_or(false);

        if accepted {
            self.submitted.fetch_add(1, Ordering::SeqCst);
        } else {
            tracing::warn!("Write queue closed; operation rejected");
        }

        QueuedWrite {
            receiver: result_rx,
        }
    }

    /// Convenience for `enqueue(op).wait()`.
    pub fn run<T, F>(&self, operation: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        self.enqueue(operation).wait()
    }

    pub fn stats(&self) -> QueueStats {
        let submitted = self.submitted.load(Ordering::SeqCst);
        let completed = self.completed.load(Ordering::SeqCst);
        QueueStats {
            submitted,
            completed,
            pending: submitted.saturating_sub(completed),
        }
    }

    /// Stops accepting work, drains what is queued, and joins the worker.
    pub fn shutdown(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let handle = self.worker.lock().ok().and_then(|mut worker| worker.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::warn!("Write queue worker panicked during shutdown");
            }
        }
    }
}

impl Drop for WriteQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn preserves_submission_order_under_varying_latency() {
        let queue = WriteQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let slow_log = Arc::clone(&log);
        let slow = queue.enqueue(move || {
            thread::sleep(Duration::from_millis(100));
            slow_log.lock().unwrap().push("slow");
            Ok(1)
        });
        let fast_log = Arc::clone(&log);
        let fast = queue.enqueue(move || {
            fast_log.lock().unwrap().push("fast");
            Ok(2)
        });

        assert_eq!(fast.wait().unwrap(), 2);
        assert_eq!(slow.wait().unwrap(), 1);
        assert_eq!(*log.lock().unwrap(), vec!["slow", "fast"]);
    }

    #[test]
    fn slow_first_write_lands_before_fast_second_write() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("doc.txt");
        let queue = WriteQueue::new();

        let first_path = path.clone();
        let first = queue.enqueue(move || {
            thread::sleep(Duration::from_millis(80));
            std::fs::write(&first_path, "first").map_err(|e| HistoryError::io("write", e))
        });
        let second_path = path.clone();
        let second = queue.enqueue(move || {
            let previous = std::fs::read_to_string(&second_path).unwrap_or_default();
            std::fs::write(&second_path, format!("{}+second", previous))
                .map_err(|e| HistoryError::io("write", e))
        });

        second.wait().unwrap();
        first.wait().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first+second");
    }

    #[test]
    fn failure_is_reported_to_its_own_caller_only() {
        let queue = WriteQueue::new();
        let failing = queue.enqueue(|| -> Result<()> { Err(HistoryError::NoActiveSession) });
        let ok = queue.enqueue(|| Ok("fine"));

        assert!(matches!(failing.wait(), Err(HistoryError::NoActiveSession)));
        assert_eq!(ok.wait().unwrap(), "fine");
    }

    #[test]
    fn panicking_operation_does_not_kill_the_worker() {
        let queue = WriteQueue::new();
        let boom = queue.enqueue(|| -> Result<()> { panic!("boom") });
        assert!(matches!(boom.wait(), Err(HistoryError::OperationPanicked)));
        assert_eq!(queue.run(|| Ok(7)).unwrap(), 7);
    }

    #[test]
    fn stats_track_submitted_and_completed() {
        let queue = WriteQueue::new();
        for i in 0..5 {
            queue.run(move || Ok(i)).unwrap();
        }
        let stats = queue.stats();
        assert_eq!(stats.submitted, 5);
        assert_eq!(stats.completed, 5);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn closed_queue_rejects_new_work() {
        let queue = WriteQueue::new();
        queue.shutdown();
        assert!(matches!(queue.run(|| Ok(())), Err(HistoryError::QueueClosed)));
        assert_eq!(queue.stats().submitted, 0);
    }
}
