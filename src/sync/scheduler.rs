//! Deferred scheduling capability.
//!
//! The engine never decides *when* a reconciliation runs; it hands a task to
//! a [`FrameScheduler`]. Hosts with a paint loop schedule on the next frame,
//! others fall back to [`TimerScheduler`]. Tests use [`ManualScheduler`] or
//! [`ImmediateScheduler`] for determinism.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

/// A deferred unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs a task once, at some later opportunity.
pub trait FrameScheduler: Send + Sync {
    /// Schedules `task` to run exactly once.
    fn schedule_once(&self, task: Task);
}

/// Runs tasks synchronously inside `schedule_once`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateScheduler;

impl FrameScheduler for ImmediateScheduler {
    fn schedule_once(&self, task: Task) {
        task();
    }
}

/// Queues tasks until [`ManualScheduler::run_pending`] is called.
#[derive(Default)]
pub struct ManualScheduler {
    queue: Mutex<VecDeque<Task>>,
}

impl ManualScheduler {
    /// Creates an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued tasks.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Runs queued tasks, including tasks scheduled while draining.
    /// Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            // Pop outside the task call so tasks may schedule more work.
            let next = self.queue.lock().pop_front();
            let Some(task) = next else {
                return ran;
            };
            task();
            ran += 1;
        }
    }
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("pending", &self.pending())
            .finish()
    }
}

impl FrameScheduler for ManualScheduler {
    fn schedule_once(&self, task: Task) {
        self.queue.lock().push_back(task);
    }
}

/// Fixed-delay fallback: a worker thread that runs each task `delay` after
/// it was received. Tasks that arrive during the delay run in the same batch.
pub struct TimerScheduler {
    delay: Duration,
    tx: Sender<Task>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl TimerScheduler {
    /// Spawns the worker thread.
    pub fn new(delay: Duration) -> io::Result<Self> {
        let (tx, rx) = unbounded::<Task>();
        let join = thread::Builder::new()
            .name("decl-timer".to_string())
            .spawn(move || timer_loop(delay, &rx))?;

        Ok(Self {
            delay,
            tx,
            join: Mutex::new(Some(join)),
        })
    }

    /// The configured delay.
    #[must_use]
    pub const fn delay(&self) -> Duration {
        self.delay
    }
}

impl fmt::Debug for TimerScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerScheduler")
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

impl FrameScheduler for TimerScheduler {
    fn schedule_once(&self, task: Task) {
        if self.tx.send(task).is_err() {
            tracing::warn!("timer scheduler worker is gone; task dropped");
        }
    }
}

impl Drop for TimerScheduler {
    fn drop(&mut self) {
        // Do not join: the last engine reference may be released by a task
        // running on the worker itself. The worker exits once `tx` is dropped.
        if let Some(handle) = self.join.lock().take() {
            drop(handle);
        }
    }
}

fn timer_loop(delay: Duration, rx: &Receiver<Task>) {
    while let Ok(first) = rx.recv() {
        thread::sleep(delay);
        let mut batch = vec![first];
        batch.extend(rx.try_iter());
        for task in batch {
            task();
        }
    }
}
