use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{Instrument, Span};

/// A unit of work. Errors are logged by the worker that ran it.
pub type Job = BoxFuture<'static, anyhow::Result<()>>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkQueueError {
    #[error("work queue is shut down")]
    ShutDown,
}

/// Fixed pool of worker tasks draining a shared FIFO of jobs.
///
/// Decouples accepting requests from processing them and bounds how many
/// requests a node works on at once.
pub struct WorkQueue {
    running: AtomicBool,
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkQueue {
    /// Spawns `worker_count` workers on the current tokio runtime. Workers log
    /// inside `span`.
    pub fn new(worker_count: usize, span: Span) -> Self {
        assert!(worker_count > 0, "a work queue needs at least one worker");

        let (sender, receiver) = mpsc::unbounded_channel::<Job>();
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let workers = (0..worker_count)
            .map(|worker| {
                let receiver = Arc::clone(&receiver);
                tokio::spawn(run_worker(receiver).instrument(tracing::trace_span!(parent: &span, "worker", worker)))
            })
            .collect();

        Self {
            running: AtomicBool::new(true),
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    /// Enqueue a job. Fails once [`WorkQueue::shutdown`] has been called.
    pub fn submit<F>(&self, job: F) -> Result<(), WorkQueueError>
    where
        F: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if !self.running.load(Ordering::Acquire) {
            tracing::warn!("job submitted after shutdown, rejecting it");
            return Err(WorkQueueError::ShutDown);
        }

        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(sender) => sender.send(job.boxed()).map_err(|_| WorkQueueError::ShutDown),
            None => Err(WorkQueueError::ShutDown),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop accepting jobs. Already queued jobs are still run, idle workers exit
    /// once the queue is empty.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        // dropping the only sender closes the channel and wakes every idle worker
        self.sender.lock().unwrap_or_else(PoisonError::into_inner).take();
        tracing::debug!("work queue shut down");
    }

    /// Wait until every worker has exited. Only returns after [`WorkQueue::shutdown`].
    pub async fn await_termination(&self) {
        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!("worker task failed: {e}");
            }
        }
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_worker(receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>>) {
    loop {
        // the receiver lock is only held while waiting for the next job, not while running it
        let job = receiver.lock().await.recv().await;
        let Some(job) = job else {
            tracing::trace!("queue closed and drained, worker exiting");
            break;
        };

        match AssertUnwindSafe(job).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("job failed: {e:#}"),
            Err(_) => tracing::error!("job panicked"),
        }
    }
}
