//! Broker transport: the channel seam and its Redis implementation.
//!
//! Requests are JSON envelopes on a Redis list. A worker claims one with
//! `BLMOVE` onto its own processing list and acknowledges it by removing it
//! from there, so unacknowledged work survives a crash and is pushed back by
//! [`BrokerChannel::recover`] when the worker starts again.

use crate::codec::ProtocolVersion;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Request envelope as pushed by requesters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<u8>,
    /// Base64 request bytes.
    pub body: String,
}

/// Reply envelope pushed onto the requester's reply list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub correlation_id: Option<String>,
    /// Base64 response bytes.
    pub body: String,
}

impl RequestEnvelope {
    /// Builds an envelope carrying `body` as base64.
    pub fn new(
        correlation_id: impl Into<String>,
        reply_to: impl Into<String>,
        protocol: ProtocolVersion,
        body: &[u8],
    ) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            reply_to: Some(reply_to.into()),
            protocol: Some(protocol.as_u8()),
            body: STANDARD.encode(body),
        }
    }
}

impl ReplyEnvelope {
    /// Builds a reply envelope carrying `body` as base64.
    pub fn new(correlation_id: Option<String>, body: &[u8]) -> Self {
        Self {
            correlation_id,
            body: STANDARD.encode(body),
        }
    }

    /// Decodes the base64 body back into response bytes.
    pub fn decode_body(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.body)
    }
}

/// Opaque token acknowledging one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryTag(pub Vec<u8>);

/// One inbound request with its routing metadata.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Protocol generation named by the requester, if any.
    pub protocol: Option<ProtocolVersion>,
    pub body: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection lost: {0}")]
    ConnectionLost(String),

    #[error("redis command failed")]
    Redis(#[source] redis::RedisError),

    #[error("failed to serialize envelope")]
    Serialize(#[from] serde_json::Error),

    #[error("broker channel is closed")]
    Closed,
}

impl BrokerError {
    /// Splits Redis failures into connection loss and everything else.
    pub fn from_redis(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            BrokerError::ConnectionLost(err.to_string())
        } else {
            BrokerError::Redis(err)
        }
    }

    /// True when the consumer should give up this channel and reconnect.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, BrokerError::ConnectionLost(_) | BrokerError::Closed)
    }
}

/// An open channel to the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Waits a bounded time for the next request. `Ok(None)` means nothing
    /// arrived in time.
    async fn next_delivery(&self) -> Result<Option<Delivery>, BrokerError>;

    async fn publish(
        &self,
        reply_to: &str,
        correlation_id: Option<String>,
        body: Vec<u8>,
    ) -> Result<(), BrokerError>;

    async fn ack(&self, tag: &DeliveryTag) -> Result<(), BrokerError>;

    /// Returns unacknowledged deliveries of this worker to the request queue.
    async fn recover(&self) -> Result<usize, BrokerError>;
}

/// Opens broker channels; called at startup and on every reconnect.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;
}

/// Redis settings shared by every channel a connector opens.
#[derive(Debug, Clone)]
pub struct RedisBrokerConfig {
    pub request_queue: String,
    pub worker_name: String,
    pub reply_ttl_secs: u64,
    pub poll_timeout_secs: f64,
}

impl RedisBrokerConfig {
    /// Name of this worker's claim list, `{queue}:processing:{worker}`.
    pub fn processing_queue(&self) -> String {
        format!("{}:processing:{}", self.request_queue, self.worker_name)
    }
}

pub struct RedisConnector {
    client: redis::Client,
    config: RedisBrokerConfig,
}

impl RedisConnector {
    /// Creates a connector for `redis_url`. No connection is opened until
    /// [`Connector::connect`] is called.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Redis` when the URL cannot be parsed.
    pub fn new(redis_url: &str, config: RedisBrokerConfig) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url).map_err(BrokerError::Redis)?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl Connector for RedisConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        // BLMOVE holds its connection for the whole poll, so replies and
        // acks go out on a second one.
        let consume = ConnectionManager::new(self.client.clone())
            .await
            .map_err(BrokerError::from_redis)?;
        let egress = ConnectionManager::new(self.client.clone())
            .await
            .map_err(BrokerError::from_redis)?;

        info!(
            queue = %self.config.request_queue,
            processing = %self.config.processing_queue(),
            "Connected to Redis broker"
        );

        Ok(Arc::new(RedisChannel {
            consume,
            egress,
            processing: self.config.processing_queue(),
            config: self.config.clone(),
        }))
    }
}

/// Channel over two Redis connections: one dedicated to the blocking claim,
/// one for publish, acknowledge and recover.
pub struct RedisChannel {
    consume: ConnectionManager,
    egress: ConnectionManager,
    processing: String,
    config: RedisBrokerConfig,
}

impl RedisChannel {
    fn parse(&self, raw: &[u8]) -> Option<Delivery> {
        let envelope: RequestEnvelope = match serde_json::from_slice(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Dropping request with malformed envelope");
                return None;
            }
        };
        let body = match STANDARD.decode(&envelope.body) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Dropping request with malformed body encoding");
                return None;
            }
        };
        let protocol = envelope.protocol.and_then(|value| {
            let version = ProtocolVersion::from_u8(value);
            if version.is_none() {
                warn!(protocol = value, "Unknown protocol version, using default");
            }
            version
        });

        Some(Delivery {
            tag: DeliveryTag(raw.to_vec()),
            correlation_id: envelope.correlation_id,
            reply_to: envelope.reply_to,
            protocol,
            body,
        })
    }
}

#[async_trait]
impl BrokerChannel for RedisChannel {
    async fn next_delivery(&self) -> Result<Option<Delivery>, BrokerError> {
        let mut conn = self.consume.clone();
        let raw: Option<Vec<u8>> = redis::cmd("BLMOVE")
            .arg(&self.config.request_queue)
            .arg(&self.processing)
            .arg("LEFT")
            .arg("RIGHT")
            .arg(self.config.poll_timeout_secs)
            .query_async(&mut conn)
            .await
            .map_err(BrokerError::from_redis)?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        match self.parse(&raw) {
            Some(delivery) => {
                debug!(correlation_id = ?delivery.correlation_id, "Claimed request");
                Ok(Some(delivery))
            }
            None => {
                // Nothing can be replied to; drop it from the processing list.
                self.ack(&DeliveryTag(raw)).await?;
                Ok(None)
            }
        }
    }

    async fn publish(
        &self,
        reply_to: &str,
        correlation_id: Option<String>,
        body: Vec<u8>,
    ) -> Result<(), BrokerError> {
        let payload = serde_json::to_vec(&ReplyEnvelope::new(correlation_id, &body))?;
        let mut conn = self.egress.clone();

        redis::pipe()
            .atomic()
            .rpush(reply_to, payload)
            .ignore()
            .cmd("EXPIRE")
            .arg(reply_to)
            .arg(self.config.reply_ttl_secs)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(BrokerError::from_redis)
    }

    async fn ack(&self, tag: &DeliveryTag) -> Result<(), BrokerError> {
        let mut conn = self.egress.clone();
        redis::cmd("LREM")
            .arg(&self.processing)
            .arg(1)
            .arg(tag.0.as_slice())
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(BrokerError::from_redis)
    }

    async fn recover(&self) -> Result<usize, BrokerError> {
        let mut conn = self.egress.clone();
        let mut recovered = 0;
        loop {
            let moved: Option<Vec<u8>> = redis::cmd("LMOVE")
                .arg(&self.processing)
                .arg(&self.config.request_queue)
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(&mut conn)
                .await
                .map_err(BrokerError::from_redis)?;
            if moved.is_none() {
                break;
            }
            recovered += 1;
        }

        if recovered > 0 {
            info!(recovered, "Requeued unacknowledged requests");
        }
        Ok(recovered)
    }
}
