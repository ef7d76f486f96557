//! Requesting side of the render RPC over Redis.

use crate::broker::{ReplyEnvelope, RequestEnvelope};
use crate::codec::{self, DecodeError, EncodeError, ProtocolVersion, RenderResponse};
use crate::job::RenderRequest;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("failed to encode request")]
    Encode(#[from] EncodeError),

    #[error("failed to decode response")]
    Decode(#[from] DecodeError),

    #[error("malformed reply envelope: {0}")]
    Envelope(String),

    #[error("redis command failed")]
    Redis(#[from] redis::RedisError),
}

/// Sends render requests and waits for their replies.
pub struct RenderClient {
    conn: ConnectionManager,
    request_queue: String,
    reply_prefix: String,
    protocol: ProtocolVersion,
}

impl RenderClient {
    /// Creates a client pushing to `request_queue`.
    ///
    /// Replies are read from `{request_queue}:reply:{correlation_id}`.
    pub fn new(conn: ConnectionManager, request_queue: impl Into<String>) -> Self {
        let request_queue = request_queue.into();
        Self {
            conn,
            reply_prefix: format!("{request_queue}:reply"),
            request_queue,
            protocol: ProtocolVersion::default(),
        }
    }

    /// Protocol version named in every request envelope.
    pub fn with_protocol(mut self, protocol: ProtocolVersion) -> Self {
        self.protocol = protocol;
        self
    }

    /// Sends `request` and waits at most `timeout` for the matching reply.
    ///
    /// # Errors
    ///
    /// * `ClientError::Timeout` - No matching reply arrived in time
    /// * `ClientError::Decode` - The reply body is not a valid response
    /// * `ClientError::Redis` - A Redis command failed
    pub async fn render(
        &mut self,
        request: &RenderRequest,
        timeout: Duration,
    ) -> Result<RenderResponse, ClientError> {
        let correlation_id = Uuid::new_v4().to_string();
        let reply_to = format!("{}:{}", self.reply_prefix, correlation_id);
        let body = codec::encode_request(request)?;
        let envelope = RequestEnvelope::new(&correlation_id, &reply_to, self.protocol, &body);
        let payload =
            serde_json::to_vec(&envelope).map_err(|e| ClientError::Envelope(e.to_string()))?;

        redis::cmd("RPUSH")
            .arg(&self.request_queue)
            .arg(payload)
            .query_async::<_, ()>(&mut self.conn)
            .await?;
        debug!(%correlation_id, "Sent render request");

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(ClientError::Timeout(timeout));
            }

            // BLPOP takes whole or fractional seconds; never pass 0 (wait forever).
            let wait = remaining.as_secs_f64().max(0.01);
            let popped: Option<(String, Vec<u8>)> = redis::cmd("BLPOP")
                .arg(&reply_to)
                .arg(wait)
                .query_async(&mut self.conn)
                .await?;
            let Some((_, raw)) = popped else {
                return Err(ClientError::Timeout(timeout));
            };

            let reply: ReplyEnvelope =
                serde_json::from_slice(&raw).map_err(|e| ClientError::Envelope(e.to_string()))?;
            if reply.correlation_id.as_deref() != Some(correlation_id.as_str()) {
                warn!(
                    expected = %correlation_id,
                    got = ?reply.correlation_id,
                    "Discarding stray reply"
                );
                continue;
            }

            let body = reply
                .decode_body()
                .map_err(|e| ClientError::Envelope(e.to_string()))?;
            return Ok(codec::decode_response(&body, self.protocol)?);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::test_request;

    // Note: requires a running Redis instance and no worker consuming
    // `skinrender:client-test:requests`.

    #[tokio::test]
    #[ignore]
    async fn test_render_times_out_without_worker() {
        let client = redis::Client::open("redis://127.0.0.1/").unwrap();
        let conn = ConnectionManager::new(client).await.unwrap();
        let mut client = RenderClient::new(conn, "skinrender:client-test:requests");

        let result = client
            .render(&test_request(8, 8), Duration::from_millis(200))
            .await;
        assert!(matches!(result, Err(ClientError::Timeout(_))));
    }
}
