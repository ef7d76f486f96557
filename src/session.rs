//! Broker session: consumes deliveries and serializes reply egress.

use crate::broker::{BrokerChannel, BrokerError, Delivery, DeliveryTag};
use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Delay before polling again after a non-connection broker error.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Receives every inbound delivery.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle_delivery(&self, delivery: Delivery);
}

/// Told when the broker connection is lost. Must not fail.
pub trait DisconnectHandler: Send + Sync {
    fn handle_disconnect(&self, err: &BrokerError);
}

/// The two callbacks a consumer is registered with.
#[derive(Clone)]
pub struct Consumer {
    pub delivery: Arc<dyn DeliveryHandler>,
    pub disconnect: Arc<dyn DisconnectHandler>,
}

/// Where a reply goes and which delivery it acknowledges.
#[derive(Debug, Clone)]
pub struct ReplyTarget {
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    pub tag: DeliveryTag,
}

impl From<&Delivery> for ReplyTarget {
    fn from(delivery: &Delivery) -> Self {
        Self {
            reply_to: delivery.reply_to.clone(),
            correlation_id: delivery.correlation_id.clone(),
            tag: delivery.tag.clone(),
        }
    }
}

/// Owns the current broker channel.
///
/// Replies from every completion go through one egress lock, so publish and
/// acknowledge pairs never interleave on the channel.
pub struct BrokerSession {
    channel: RwLock<Option<Arc<dyn BrokerChannel>>>,
    egress: Mutex<()>,
}

impl Default for BrokerSession {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerSession {
    /// Creates a session with no channel yet.
    pub fn new() -> Self {
        Self {
            channel: RwLock::new(None),
            egress: Mutex::new(()),
        }
    }

    /// Current channel, if one has been attached.
    pub fn channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        match self.channel.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Swaps in the channel opened by the latest connect.
    pub fn replace_channel(&self, channel: Arc<dyn BrokerChannel>) {
        match self.channel.write() {
            Ok(mut guard) => *guard = Some(channel),
            Err(poisoned) => *poisoned.into_inner() = Some(channel),
        }
    }

    /// Publishes `body` to the reply destination, then acknowledges the
    /// delivery. Failures are logged and never returned.
    ///
    /// A failed publish leaves the delivery unacknowledged; it stays claimed
    /// until the worker next starts.
    pub async fn reply(&self, target: &ReplyTarget, body: Vec<u8>) {
        let _guard = self.egress.lock().await;

        let Some(channel) = self.channel() else {
            error!(correlation_id = ?target.correlation_id, "No broker channel, response dropped");
            return;
        };

        match target.reply_to.as_deref() {
            Some(reply_to) => {
                if let Err(e) = channel
                    .publish(reply_to, target.correlation_id.clone(), body)
                    .await
                {
                    error!(
                        correlation_id = ?target.correlation_id,
                        reply_to,
                        error = %e,
                        "Failed to publish response"
                    );
                    return;
                }
                debug!(correlation_id = ?target.correlation_id, reply_to, "Published response");
            }
            None => {
                warn!(correlation_id = ?target.correlation_id, "Request has no reply destination");
            }
        }

        if let Err(e) = channel.ack(&target.tag).await {
            error!(
                correlation_id = ?target.correlation_id,
                error = %e,
                "Failed to acknowledge request"
            );
        }
    }

    /// Runs the consume loop on `channel` until `token` is cancelled or the
    /// connection is lost.
    pub fn spawn_consumer(
        &self,
        channel: Arc<dyn BrokerChannel>,
        consumer: Consumer,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(consume(channel, consumer, token))
    }
}

async fn consume(channel: Arc<dyn BrokerChannel>, consumer: Consumer, token: CancellationToken) {
    info!("Consumer registered");

    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            next = channel.next_delivery() => next,
        };

        match next {
            Ok(Some(delivery)) => consumer.delivery.handle_delivery(delivery).await,
            Ok(None) => {}
            Err(e) if e.is_connection_lost() => {
                warn!(error = %e, "Broker signalled disconnect");
                consumer.disconnect.handle_disconnect(&e);
                break;
            }
            Err(e) => {
                error!(error = %e, "Failed to receive request");
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                }
            }
        }
    }

    info!("Consumer stopped");
}
