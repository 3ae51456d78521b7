//! A fixed set of worker threads draining a shared FIFO queue.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{Builder, JoinHandle};

use anyhow::{Context, Result};

/// A unit of work. Runs once, on one worker, with the context the pool was built with.
pub type Task<C> = Box<dyn FnOnce(&C) + Send + 'static>;

struct Shared<C> {
    queue: Mutex<VecDeque<Task<C>>>,
    wake: Condvar,
    shutdown: AtomicBool,
    context: Arc<C>,
}

impl<C> Shared<C> {
    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<Task<C>>> {
        // Tasks never run under the lock, so a poisoned queue is still consistent.
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until there is a task to run, or return None once shut down and drained.
    fn next_task(&self) -> Option<Task<C>> {
        let queue = self.lock_queue();
        let mut queue = self
            .wake
            .wait_while(queue, |queue| {
                queue.is_empty() && !self.shutdown.load(Ordering::Acquire)
            })
            .unwrap_or_else(PoisonError::into_inner);
        queue.pop_front()
    }
}

/// Worker pool handing every task a shared, read-only context `C`.
pub struct WorkerPool<C: Send + Sync + 'static> {
    shared: Arc<Shared<C>>,
    workers: Vec<JoinHandle<()>>,
}

impl<C: Send + Sync + 'static> WorkerPool<C> {
    /// Spawn `size` workers. `size` must be at least 1.
    pub fn new(size: usize, context: Arc<C>) -> Result<Self> {
        assert!(size > 0);

        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            wake: Condvar::new(),
            shutdown: AtomicBool::new(false),
            context,
        });

        let mut pool = Self {
            shared,
            workers: Vec::with_capacity(size),
        };
        for id in 0..size {
            let shared = Arc::clone(&pool.shared);
            let worker = Builder::new()
                .name(format!("worker-{}", id))
                .spawn(move || work(id, &shared))
                .with_context(|| format!("failed to spawn worker {}", id))?;
            pool.workers.push(worker);
        }
        Ok(pool)
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queue a task and wake one idle worker. Never blocks on the task itself.
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce(&C) + Send + 'static,
    {
        self.shared.lock_queue().push_back(Box::new(task));
        self.shared.wake.notify_one();
    }

    /// Let the workers finish everything queued so far, then join them.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.shared.shutdown.store(true, Ordering::Release);
        // A worker between checking the flag and waiting holds the lock; taking it here means
        // the notification below cannot slip in between.
        drop(self.shared.lock_queue());
        self.shared.wake.notify_all();

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                eprintln!("warning: worker thread panicked");
            }
        }
    }
}

impl<C: Send + Sync + 'static> Drop for WorkerPool<C> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn work<C>(id: usize, shared: &Shared<C>) {
    while let Some(task) = shared.next_task() {
        let context = &*shared.context;
        if catch_unwind(AssertUnwindSafe(|| task(context))).is_err() {
            eprintln!("warning: task panicked in worker {}", id);
        }
    }
}
