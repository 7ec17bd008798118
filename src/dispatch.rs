//! Deferred-execution queue shared by one client
//!
//! All outbound callbacks and events go through a single FIFO queue drained
//! by one worker task, so nothing the library emits ever runs inside the call
//! stack that armed it, and burst ordering is exactly enqueue ordering.
//! Timers are sleep tasks that enqueue their job on expiry, which serializes
//! timer callbacks through the same queue.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Cheap-clone handle to a client's deferral queue
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Job>,
}

impl Dispatcher {
    /// Create a queue and spawn its worker task
    ///
    /// Must be called within a tokio runtime. The worker exits when every
    /// handle to the queue has been dropped.
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job();
            }
            tracing::debug!("dispatch queue closed, worker exiting");
        });
        Self { tx }
    }

    /// Enqueue a job to run on a later queue turn
    pub fn defer(&self, job: impl FnOnce() + Send + 'static) {
        if self.tx.send(Box::new(job)).is_err() {
            tracing::debug!("dispatch queue gone, dropping deferred job");
        }
    }

    /// Arm a timer that enqueues `job` after `delay`
    ///
    /// The returned handle cancels the timer; jobs must still revalidate
    /// state when they run, since cancellation can race an expiry that
    /// already enqueued.
    pub fn schedule(
        &self,
        delay: Duration,
        job: impl FnOnce() + Send + 'static,
    ) -> TimerHandle {
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(Box::new(job) as Job).is_err() {
                tracing::debug!("dispatch queue gone, dropping timer job");
            }
        });
        TimerHandle { task }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to an armed timer
///
/// Dropping the handle cancels the timer; `cancel` does the same explicitly.
#[derive(Debug)]
pub struct TimerHandle {
    task: JoinHandle<()>,
}

impl TimerHandle {
    pub fn cancel(self) {
        self.task.abort();
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
