//! Local path: render through a worker context without a broker.

use crate::context::WorkerContext;
use crate::job::{RenderJob, RenderRequest, WaitError};
use resvg::tiny_skia::Pixmap;
use std::time::Duration;

/// Queues `request` on `context` and waits at most `timeout` for the image.
///
/// `WaitError::Timeout` means nothing came back in time;
/// `WaitError::Failed` carries an explicit failure.
pub async fn render_blocking(
    context: &WorkerContext,
    request: RenderRequest,
    timeout: Duration,
) -> Result<Pixmap, WaitError> {
    let (job, handle) = RenderJob::new(request);
    // Rejection already resolved the job; the handle reports it.
    let _ = context.queue_request(job);
    handle.wait(timeout).await
}
