use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::errors::BuildError;

/// A cancellation handle shared between a pool and every task it runs. In
/// `fail-fast` mode the first failing task cancels it; tasks are expected to
/// check it at the head of any loop and exit promptly once set.
#[derive(Clone, Default)]
pub struct CancellationContext {
    cancelled: Arc<AtomicBool>,
}

impl CancellationContext {
    pub fn new() -> Self {
        CancellationContext::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

pub type Task = Box<dyn FnOnce(&CancellationContext) -> Result<(), BuildError> + Send>;

/// A bounded-concurrency task runner. `push` enqueues work; `wait` drains the
/// queue, joins every worker thread, and returns the most recently observed
/// failing task's error, if any.
pub struct WorkerPool {
    sender: Option<mpsc::Sender<Task>>,
    handles: Vec<JoinHandle<()>>,
    last_err: Arc<Mutex<Option<BuildError>>>,
    ctx: CancellationContext,
    capacity: usize,
}

impl WorkerPool {
    pub fn new(workers: usize, fail_fast: bool) -> Self {
        WorkerPool::with_context(workers, fail_fast, CancellationContext::new())
    }

    /// Like `new`, but joins an externally-constructed cancellation context
    /// so several pools can share one fail-fast signal.
    pub fn with_context(workers: usize, fail_fast: bool, ctx: CancellationContext) -> Self {
        let capacity = workers.max(1);
        let (tx, rx) = mpsc::channel::<Task>();
        let rx = Arc::new(Mutex::new(rx));
        let last_err: Arc<Mutex<Option<BuildError>>> = Arc::new(Mutex::new(None));

        let handles = (0..capacity)
            .map(|_| {
                let rx = rx.clone();
                let last_err = last_err.clone();
                let ctx = ctx.clone();
                thread::spawn(move || loop {
                    let task = {
                        let locked = rx.lock().expect("worker pool receiver mutex poisoned");
                        locked.recv()
                    };
                    let task = match task {
                        Ok(task) => task,
                        Err(_) => break,
                    };

                    if let Err(err) = task(&ctx) {
                        if fail_fast {
                            ctx.cancel();
                        }
                        *last_err.lock().expect("worker pool error mutex poisoned") = Some(err);
                    }
                })
            })
            .collect();

        WorkerPool {
            sender: Some(tx),
            handles,
            last_err,
            ctx,
            capacity,
        }
    }

    pub fn cancellation(&self) -> CancellationContext {
        self.ctx.clone()
    }

    pub fn cap(&self) -> usize {
        self.capacity
    }

    /// Enqueues a task. Panics if called after `wait()` has been run
    /// (programming error: the pool has already been torn down).
    pub fn push(&self, task: Task) {
        let sender = self.sender.as_ref().expect("push called after wait()");
        sender.send(task).expect("worker pool threads exited unexpectedly");
    }

    /// Closes the queue, joins every worker, and returns the most recently
    /// observed failing task's error.
    pub fn wait(mut self) -> Option<BuildError> {
        self.sender.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        self.last_err.lock().expect("worker pool error mutex poisoned").take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn pool_capacity_matches_configured_workers() {
        let pool = WorkerPool::new(4, false);
        assert_eq!(pool.cap(), 4);
        pool.wait();
    }

    #[test]
    fn all_pushed_tasks_complete() {
        let pool = WorkerPool::new(3, false);
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..11 {
            let count = count.clone();
            pool.push(Box::new(move |_ctx| {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }
        let err = pool.wait();
        assert!(err.is_none());
        assert_eq!(count.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn wait_returns_most_recent_error() {
        let pool = WorkerPool::new(1, false);
        pool.push(Box::new(|_ctx| {
            Err(BuildError::Config(crate::errors::ConfigError::NoPaths))
        }));
        let err = pool.wait();
        assert!(err.is_some());
    }

    #[test]
    fn fail_fast_cancels_shared_context() {
        let pool = WorkerPool::new(2, true);
        let ctx = pool.cancellation();

        pool.push(Box::new(|_ctx| {
            Err(BuildError::Config(crate::errors::ConfigError::NoPaths))
        }));
        pool.push(Box::new(move |ctx| {
            // give the failing task a chance to cancel first
            thread::sleep(Duration::from_millis(50));
            if ctx.is_cancelled() {
                return Ok(());
            }
            Ok(())
        }));

        pool.wait();
        assert!(ctx.is_cancelled());
    }
}
