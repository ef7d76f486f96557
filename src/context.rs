//! Worker context: one serialized renderer fed by a bounded job queue.

use crate::error::{ErrorRecord, FailureKind};
use crate::job::RenderJob;
use crate::renderer::{RenderError, Renderer};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Instant;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What `submit` does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackpressurePolicy {
    /// Fail the job immediately with a `QueueFull` record.
    Reject,
    /// Wait for queue capacity.
    #[default]
    Block,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("render queue of worker {index} is full")]
    Full { index: usize },

    #[error("render worker {index} has stopped")]
    Stopped { index: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("failed to start render worker {index}")]
    Spawn {
        index: usize,
        #[source]
        source: std::io::Error,
    },
}

/// A single rendering worker.
///
/// Jobs run strictly in queue order, one at a time, on a dedicated thread
/// that owns the renderer.
pub struct WorkerContext {
    index: usize,
    tx: mpsc::Sender<RenderJob>,
    policy: BackpressurePolicy,
    token: CancellationToken,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerContext {
    /// Spawns the dispatch loop and returns the context feeding it.
    pub fn start(
        index: usize,
        capacity: usize,
        policy: BackpressurePolicy,
        renderer: Box<dyn Renderer>,
    ) -> Result<Self, ContextError> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let token = CancellationToken::new();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .map_err(|source| ContextError::Spawn { index, source })?;
        let loop_token = token.clone();
        let thread = std::thread::Builder::new()
            .name(format!("render-worker-{index}"))
            .spawn(move || runtime.block_on(dispatch_loop(index, rx, renderer, loop_token)))
            .map_err(|source| ContextError::Spawn { index, source })?;

        info!(worker = index, capacity, ?policy, "Render worker started");

        Ok(Self {
            index,
            tx,
            policy,
            token,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Position of this context in the pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Enqueues without ever blocking.
    ///
    /// A job that cannot be queued is resolved with a failure record before
    /// this returns, so its handle never waits forever.
    pub fn queue_request(&self, job: RenderJob) -> Result<(), QueueError> {
        match self.tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => {
                let err = QueueError::Full { index: self.index };
                job.fail(ErrorRecord::from_error(FailureKind::QueueFull, &err));
                Err(err)
            }
            Err(TrySendError::Closed(job)) => {
                let err = QueueError::Stopped { index: self.index };
                job.fail(ErrorRecord::from_error(FailureKind::WorkerStopped, &err));
                Err(err)
            }
        }
    }

    /// Enqueues according to the context's backpressure policy.
    pub async fn submit(&self, job: RenderJob) -> Result<(), QueueError> {
        match self.policy {
            BackpressurePolicy::Reject => self.queue_request(job),
            BackpressurePolicy::Block => match self.tx.send(job).await {
                Ok(()) => Ok(()),
                Err(mpsc::error::SendError(job)) => {
                    let err = QueueError::Stopped { index: self.index };
                    job.fail(ErrorRecord::from_error(FailureKind::WorkerStopped, &err));
                    Err(err)
                }
            },
        }
    }

    /// Number of jobs waiting to start.
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// False once the dispatch loop has exited.
    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Requests shutdown. The in-flight job finishes; queued jobs are
    /// abandoned and their handles report `WaitError::Abandoned`.
    pub fn interrupt(&self) {
        self.token.cancel();
    }

    /// Blocks until the dispatch thread has exited.
    pub fn join(&self) {
        let handle = match self.thread.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(worker = self.index, "Render worker thread panicked");
            }
        }
    }
}

async fn dispatch_loop(
    index: usize,
    mut rx: mpsc::Receiver<RenderJob>,
    mut renderer: Box<dyn Renderer>,
    token: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        process_job(index, renderer.as_mut(), job);
    }

    rx.close();
    let mut abandoned = 0usize;
    while let Ok(job) = rx.try_recv() {
        drop(job);
        abandoned += 1;
    }
    if abandoned > 0 {
        warn!(worker = index, abandoned, "Render worker stopped with queued jobs");
    }
    info!(worker = index, "Render worker stopped");
}

fn process_job(index: usize, renderer: &mut dyn Renderer, job: RenderJob) {
    let job_id = job.id;
    let waited_ms = job.age_ms();
    let (request, completion) = job.into_parts();
    let started = Instant::now();

    let result = panic::catch_unwind(AssertUnwindSafe(|| renderer.render(&request)))
        .unwrap_or_else(|payload| Err(RenderError::Panicked(panic_message(payload.as_ref()))));

    let render_ms = started.elapsed().as_millis() as u64;
    match result {
        Ok(image) => {
            debug!(worker = index, %job_id, waited_ms, render_ms, "Render finished");
            completion.succeed(image);
        }
        Err(e) => {
            warn!(worker = index, %job_id, render_ms, error = %e, "Render failed");
            completion.fail(ErrorRecord::from_error(FailureKind::Render, &e));
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
