// File:    scheduler.rs
// Author:  apezoo
// Date:    2026-10-16
//
// Description: Single-threaded timer scheduler with cancellable one-shot and repeating tasks.
//
// License:
// This project is licensed under the terms of the GNU AGPLv3 license.
// See the LICENSE.md file in the project root for full license information.

//! Timer scheduler.
//!
//! One background thread runs every task in due order. Tasks must be short:
//! they usually just post an event to their owner.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use log::debug;

type Task = Box<dyn FnMut() + Send>;

/// Handle to a scheduled task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    /// Prevents any further run of the task.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// True once cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

struct Entry {
    due: Instant,
    seq: u64,
    repeat: Option<Duration>,
    cancelled: Arc<AtomicBool>,
    task: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the max-heap pops the earliest entry first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Queue {
    entries: BinaryHeap<Entry>,
    next_seq: u64,
    shutdown: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    wakeup: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Runs delayed and repeating tasks on one background thread.
///
/// The thread is stopped and joined when the scheduler is dropped.
pub struct Scheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl Scheduler {
    /// Starts the scheduler thread.
    pub fn start() -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            wakeup: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("otpbox-scheduler".into())
            .spawn(move || run(&thread_shared))?;
        let worker_id = worker.thread().id();
        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
            worker_id,
        })
    }

    /// Runs `task` after `delay`, then every `repeat` when given.
    pub fn schedule<F>(&self, task: F, delay: Duration, repeat: Option<Duration>) -> TaskHandle
    where
        F: FnMut() + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut queue = self.shared.lock();
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.entries.push(Entry {
            due: Instant::now() + delay,
            seq,
            repeat,
            cancelled: Arc::clone(&cancelled),
            task: Box::new(task),
        });
        drop(queue);
        self.shared.wakeup.notify_one();
        TaskHandle { cancelled }
    }

    /// Number of tasks waiting to run.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.lock().entries.len()
    }

    /// Stops the thread; pending tasks are dropped without running.
    pub fn shutdown(&self) {
        self.shared.lock().shutdown = true;
        self.shared.wakeup.notify_all();
        // A task may drop the last owner of the scheduler from inside the worker.
        if self.worker_id == thread::current().id() {
            return;
        }
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker
            && worker.join().is_err()
        {
            debug!("Scheduler thread panicked");
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: &Shared) {
    let mut queue = shared.lock();
    loop {
        if queue.shutdown {
            queue.entries.clear();
            return;
        }
        let now = Instant::now();
        match queue.entries.peek().map(|entry| entry.due) {
            None => {
                queue = shared
                    .wakeup
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            Some(due) if due > now => {
                queue = shared
                    .wakeup
                    .wait_timeout(queue, due - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
            Some(_) => {
                let Some(mut entry) = queue.entries.pop() else {
                    continue;
                };
                if entry.cancelled.load(Ordering::Relaxed) {
                    continue;
                }
                drop(queue);
                (entry.task)();
                queue = shared.lock();
                if let Some(period) = entry.repeat
                    && !entry.cancelled.load(Ordering::Relaxed)
                {
                    entry.due += period;
                    queue.entries.push(entry);
                }
            }
        }
    }
}
