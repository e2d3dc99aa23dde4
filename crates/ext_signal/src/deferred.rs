//! Deferred execution queue
//!
//! Work pushed here runs on the engine's main context the next time the
//! queue is flushed. Order is FIFO.

use std::panic::{self, AssertUnwindSafe};

use crossbeam_channel::{unbounded, Receiver, Sender};
use once_cell::sync::Lazy;

type Task = Box<dyn FnOnce() + Send>;

static GLOBAL: Lazy<DeferredQueue> = Lazy::new(DeferredQueue::new);

/// FIFO queue of closures awaiting the main context
#[derive(Clone)]
pub struct DeferredQueue {
    tx: Sender<Task>,
    rx: Receiver<Task>,
}

impl DeferredQueue {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    /// Process-wide queue flushed by the bridge
    pub fn global() -> &'static DeferredQueue {
        &GLOBAL
    }

    /// Queue a closure
    pub fn push<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // both ends live in `self`, so the channel cannot be disconnected
        let _ = self.tx.send(Box::new(task));
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Run the tasks queued before this call. Tasks queued while flushing
    /// wait for the next flush. Returns the number of tasks run.
    pub fn flush(&self) -> usize {
        let pending = self.rx.len();
        let mut ran = 0;
        for task in self.rx.try_iter().take(pending) {
            if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                log::error!("Deferred task panicked");
            }
            ran += 1;
        }
        ran
    }
}

impl Default for DeferredQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_fifo_order() {
        let queue = DeferredQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let log = log.clone();
            queue.push(move || log.lock().push(i));
        }
        assert_eq!(queue.len(), 5);
        assert_eq!(queue.flush(), 5);
        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_tasks_queued_during_flush_wait() {
        let queue = DeferredQueue::new();
        let inner = queue.clone();
        queue.push(move || inner.push(|| {}));
        assert_eq!(queue.flush(), 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.flush(), 1);
    }

    #[test]
    fn test_panicking_task_does_not_stop_flush() {
        let queue = DeferredQueue::new();
        let hit = Arc::new(Mutex::new(false));
        queue.push(|| panic!("boom"));
        let flag = hit.clone();
        queue.push(move || *flag.lock() = true);
        assert_eq!(queue.flush(), 2);
        assert!(*hit.lock());
    }
}
