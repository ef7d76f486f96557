//! Request/reply glue between the broker session and the worker pool.

use crate::broker::Delivery;
use crate::codec::{self, ProtocolVersion};
use crate::error::{ErrorRecord, FailureKind};
use crate::job::{JobOutcome, RenderJob, RenderMode, WaitError};
use crate::server::WorkerPool;
use crate::session::{BrokerSession, DeliveryHandler, ReplyTarget};
use crate::telemetry::{self, JobReport};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

/// Decodes each delivery, queues it on the next worker and replies once the
/// job resolves. Decode failures are answered with a failure response too.
#[derive(Clone)]
pub struct RpcHandler {
    pool: Arc<WorkerPool>,
    session: Arc<BrokerSession>,
    default_protocol: ProtocolVersion,
}

impl RpcHandler {
    /// Creates the handler.
    ///
    /// # Arguments
    ///
    /// * `pool` - Worker contexts jobs are queued on
    /// * `session` - Session replies are published through
    /// * `default_protocol` - Used when a delivery names no protocol version
    pub fn new(
        pool: Arc<WorkerPool>,
        session: Arc<BrokerSession>,
        default_protocol: ProtocolVersion,
    ) -> Self {
        Self {
            pool,
            session,
            default_protocol,
        }
    }

    async fn respond(
        &self,
        target: &ReplyTarget,
        outcome: JobOutcome,
        received: Instant,
        protocol: ProtocolVersion,
        request: Option<(RenderMode, u32, u32)>,
    ) {
        let elapsed = received.elapsed();
        let worker_name = self.pool.worker_name();

        let encoded = codec::encode_response(&outcome, worker_name, elapsed, protocol);
        let (body, failure) = match encoded {
            Ok(body) => (body, outcome.err().map(|record| record.kind)),
            Err(e) => {
                error!(
                    correlation_id = ?target.correlation_id,
                    error = %e,
                    "Failed to encode response"
                );
                let record = ErrorRecord::from_error(FailureKind::Encode, &e);
                match codec::encode_response(&Err(record.clone()), worker_name, elapsed, protocol) {
                    Ok(body) => (body, Some(record.kind)),
                    Err(e) => {
                        error!(error = %e, "Failed to encode failure response");
                        return;
                    }
                }
            }
        };

        telemetry::record_job_telemetry(&JobReport {
            worker_name,
            correlation_id: target.correlation_id.as_deref(),
            mode: request.map(|(mode, _, _)| mode),
            size: request.map(|(_, width, height)| (width, height)),
            failure: failure.as_deref(),
            elapsed_ms: elapsed.as_millis() as u64,
        });

        self.session.reply(target, body).await;
    }
}

#[async_trait]
impl DeliveryHandler for RpcHandler {
    async fn handle_delivery(&self, delivery: Delivery) {
        let received = Instant::now();
        let protocol = delivery.protocol.unwrap_or(self.default_protocol);
        let target = ReplyTarget::from(&delivery);

        let request = match codec::decode_request(&delivery.body) {
            Ok(request) => request,
            Err(e) => {
                warn!(
                    correlation_id = ?target.correlation_id,
                    error = %e,
                    "Rejecting undecodable request"
                );
                self.respond(&target, Err(e.to_record()), received, protocol, None)
                    .await;
                return;
            }
        };

        let summary = (request.mode, request.width, request.height);
        let context = self.pool.next_renderer();
        let (job, handle) = RenderJob::new(request);
        debug!(
            job_id = %job.id,
            worker = context.index(),
            correlation_id = ?target.correlation_id,
            "Queueing render job"
        );

        // A job that cannot be queued is already resolved with a failure,
        // which the continuation below answers.
        if let Err(e) = context.submit(job).await {
            warn!(correlation_id = ?target.correlation_id, error = %e, "Render job not queued");
        }

        let responder = self.clone();
        tokio::spawn(async move {
            let outcome = match handle.outcome().await {
                Ok(image) => Ok(image),
                Err(WaitError::Failed(record)) => Err(record),
                Err(e) => {
                    // Left unacknowledged; requeued when the worker next starts.
                    warn!(
                        correlation_id = ?target.correlation_id,
                        error = %e,
                        "Render job abandoned"
                    );
                    return;
                }
            };
            responder
                .respond(&target, outcome, received, protocol, Some(summary))
                .await;
        });
    }
}
