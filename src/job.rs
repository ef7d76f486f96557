//! Render job model and its single-fulfillment completion handle.

use crate::error::ErrorRecord;
use chrono::{DateTime, Utc};
use resvg::tiny_skia::Pixmap;
use std::fmt;
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Template selector, encoded on the wire by its ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderMode {
    /// Full front figure.
    Body,
    /// Head only.
    Head,
    /// Head, torso and arms.
    Bust,
}

impl RenderMode {
    pub const ALL: [RenderMode; 3] = [RenderMode::Body, RenderMode::Head, RenderMode::Bust];

    /// Maps a wire ordinal to a mode. Unknown ordinals yield `None`.
    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        Self::ALL.get(ordinal as usize).copied()
    }

    /// Wire ordinal of the mode.
    pub fn ordinal(self) -> u8 {
        match self {
            RenderMode::Body => 0,
            RenderMode::Head => 1,
            RenderMode::Bust => 2,
        }
    }
}

impl fmt::Display for RenderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderMode::Body => write!(f, "body"),
            RenderMode::Head => write!(f, "head"),
            RenderMode::Bust => write!(f, "bust"),
        }
    }
}

/// Parameters of one render, exactly what travels in a request.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderRequest {
    pub mode: RenderMode,
    pub width: u32,
    pub height: u32,
    /// Decoded skin texture.
    pub source_image: Pixmap,
    pub rotation_x: i32,
    pub rotation_y: i32,
    pub leg_rotation: i32,
    pub flipped: bool,
    pub slim: bool,
}

/// Result a job resolves with.
pub type JobOutcome = Result<Pixmap, ErrorRecord>;

/// Producer half of a job's result. Resolving consumes it.
#[derive(Debug)]
pub struct Completion {
    tx: oneshot::Sender<JobOutcome>,
}

impl Completion {
    /// Delivers `outcome` to the handle. A handle that was dropped is ignored.
    pub fn resolve(self, outcome: JobOutcome) {
        // The receiver is gone when the caller stopped waiting.
        let _ = self.tx.send(outcome);
    }

    pub fn succeed(self, image: Pixmap) {
        self.resolve(Ok(image));
    }

    pub fn fail(self, record: ErrorRecord) {
        self.resolve(Err(record));
    }
}

/// Why waiting on a job produced no image.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("timed out after {0:?} waiting for render")]
    Timeout(Duration),

    #[error("render failed: {0}")]
    Failed(ErrorRecord),

    #[error("render job was abandoned before it ran")]
    Abandoned,
}

/// Consumer half of a job's result.
#[derive(Debug)]
pub struct JobHandle {
    rx: oneshot::Receiver<JobOutcome>,
}

impl JobHandle {
    /// Waits until the job is resolved or abandoned.
    pub async fn outcome(self) -> Result<Pixmap, WaitError> {
        match self.rx.await {
            Ok(Ok(image)) => Ok(image),
            Ok(Err(record)) => Err(WaitError::Failed(record)),
            Err(_) => Err(WaitError::Abandoned),
        }
    }

    /// Bounded wait. A timeout is reported separately from a failed render.
    pub async fn wait(self, timeout: Duration) -> Result<Pixmap, WaitError> {
        match tokio::time::timeout(timeout, self.outcome()).await {
            Ok(result) => result,
            Err(_) => Err(WaitError::Timeout(timeout)),
        }
    }
}

/// One unit of render work.
#[derive(Debug)]
pub struct RenderJob {
    pub id: Uuid,
    pub request: RenderRequest,
    pub created_at: DateTime<Utc>,
    completion: Completion,
}

impl RenderJob {
    /// Creates a job and the handle its result is delivered to.
    ///
    /// # Returns
    ///
    /// The job, to be queued on a worker context, and the handle the caller
    /// waits on. Dropping the job unresolved makes the handle report
    /// [`WaitError::Abandoned`].
    pub fn new(request: RenderRequest) -> (Self, JobHandle) {
        let (tx, rx) = oneshot::channel();
        let job = Self {
            id: Uuid::new_v4(),
            request,
            created_at: Utc::now(),
            completion: Completion { tx },
        };
        (job, JobHandle { rx })
    }

    /// Splits the job into its request and the completion the renderer resolves.
    pub fn into_parts(self) -> (RenderRequest, Completion) {
        (self.request, self.completion)
    }

    /// Resolves the job with a failure without rendering it.
    pub fn fail(self, record: ErrorRecord) {
        self.completion.fail(record);
    }

    /// Milliseconds since the job was created.
    pub fn age_ms(&self) -> i64 {
        Utc::now()
            .signed_duration_since(self.created_at)
            .num_milliseconds()
    }
}

#[cfg(test)]
pub(crate) fn test_request(width: u32, height: u32) -> RenderRequest {
    let mut texture = Pixmap::new(64, 64).unwrap();
    texture.fill(resvg::tiny_skia::Color::from_rgba8(200, 120, 40, 255));
    RenderRequest {
        mode: RenderMode::Body,
        width,
        height,
        source_image: texture,
        rotation_x: 0,
        rotation_y: 0,
        leg_rotation: 0,
        flipped: false,
        slim: false,
    }
}
