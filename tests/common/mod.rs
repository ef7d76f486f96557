//! Shared fixtures: textures, stub renderers and an in-memory broker.

#![allow(dead_code)]

use async_trait::async_trait;
use resvg::tiny_skia::{Color, Pixmap};
use skin_render_worker::broker::{BrokerChannel, BrokerError, Connector, Delivery, DeliveryTag};
use skin_render_worker::codec::ProtocolVersion;
use skin_render_worker::job::{RenderMode, RenderRequest};
use skin_render_worker::renderer::{RenderError, Renderer};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn texture(width: u32, height: u32, color: Color) -> Pixmap {
    let mut pixmap = Pixmap::new(width, height).unwrap();
    pixmap.fill(color);
    pixmap
}

pub fn scenario_a_request() -> RenderRequest {
    RenderRequest {
        mode: RenderMode::Body,
        width: 128,
        height: 128,
        source_image: texture(64, 64, Color::from_rgba8(90, 60, 30, 255)),
        rotation_x: 30,
        rotation_y: 45,
        leg_rotation: 0,
        flipped: false,
        slim: true,
    }
}

/// Returns a fixed raster and records every request it sees.
pub struct FixedRenderer {
    pub image: Pixmap,
    pub seen: Arc<Mutex<Vec<RenderRequest>>>,
}

impl Renderer for FixedRenderer {
    fn render(&mut self, request: &RenderRequest) -> Result<Pixmap, RenderError> {
        self.seen.lock().unwrap().push(request.clone());
        Ok(self.image.clone())
    }
}

/// Fails every request whose width is odd.
pub struct OddWidthFails;

impl Renderer for OddWidthFails {
    fn render(&mut self, request: &RenderRequest) -> Result<Pixmap, RenderError> {
        if request.width % 2 == 1 {
            return Err(RenderError::Other(format!("odd width {}", request.width)));
        }
        Ok(Pixmap::new(request.width, request.height).unwrap())
    }
}

/// Sleeps a fixed time per job and logs job widths in completion order.
pub struct SleepyRenderer {
    pub delay: Duration,
    pub order: Arc<Mutex<Vec<u32>>>,
}

impl Renderer for SleepyRenderer {
    fn render(&mut self, request: &RenderRequest) -> Result<Pixmap, RenderError> {
        std::thread::sleep(self.delay);
        self.order.lock().unwrap().push(request.width);
        Ok(Pixmap::new(1, 1).unwrap())
    }
}

#[derive(Debug, Clone)]
pub struct PublishedReply {
    pub reply_to: String,
    pub correlation_id: Option<String>,
    pub body: Vec<u8>,
}

/// Broker state shared by every channel the connector opens.
#[derive(Default)]
pub struct Hub {
    requests: Mutex<VecDeque<Delivery>>,
    request_ready: Notify,
    replies: Mutex<VecDeque<PublishedReply>>,
    reply_ready: Notify,
    acks: Mutex<Vec<DeliveryTag>>,
    next_tag: AtomicUsize,
    /// Channels opened at or before this generation are dead.
    dropped_generation: AtomicUsize,
    pub connects: AtomicUsize,
}

impl Hub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(
        &self,
        correlation_id: &str,
        reply_to: Option<&str>,
        protocol: Option<ProtocolVersion>,
        body: Vec<u8>,
    ) -> DeliveryTag {
        let tag = DeliveryTag(self.next_tag.fetch_add(1, Ordering::SeqCst).to_be_bytes().to_vec());
        self.requests.lock().unwrap().push_back(Delivery {
            tag: tag.clone(),
            correlation_id: Some(correlation_id.to_string()),
            reply_to: reply_to.map(str::to_string),
            protocol,
            body,
        });
        self.request_ready.notify_one();
        tag
    }

    pub async fn next_reply(&self) -> PublishedReply {
        tokio::time::timeout(WAIT, async {
            loop {
                let notified = self.reply_ready.notified();
                let published = self.replies.lock().unwrap().pop_front();
                if let Some(reply) = published {
                    return reply;
                }
                notified.await;
            }
        })
        .await
        .expect("no reply published in time")
    }

    pub fn acks(&self) -> Vec<DeliveryTag> {
        self.acks.lock().unwrap().clone()
    }

    pub async fn wait_for_acks(&self, count: usize) -> Vec<DeliveryTag> {
        tokio::time::timeout(WAIT, async {
            loop {
                let acks = self.acks();
                if acks.len() >= count {
                    return acks;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("request not acknowledged in time")
    }

    pub fn pending_replies(&self) -> usize {
        self.replies.lock().unwrap().len()
    }

    /// Kills every channel opened so far.
    pub fn drop_connections(&self) {
        self.dropped_generation
            .store(self.connects.load(Ordering::SeqCst), Ordering::SeqCst);
        self.request_ready.notify_waiters();
    }

    pub async fn wait_for_connects(&self, count: usize) {
        tokio::time::timeout(WAIT, async {
            while self.connects.load(Ordering::SeqCst) < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("reconnect did not happen in time")
    }
}

pub struct MemoryConnector {
    pub hub: Arc<Hub>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let generation = self.hub.connects.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Arc::new(MemoryChannel {
            hub: self.hub.clone(),
            generation,
        }))
    }
}

pub struct MemoryChannel {
    hub: Arc<Hub>,
    generation: usize,
}

impl MemoryChannel {
    fn check(&self) -> Result<(), BrokerError> {
        if self.generation <= self.hub.dropped_generation.load(Ordering::SeqCst) {
            return Err(BrokerError::ConnectionLost("connection reset".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn next_delivery(&self) -> Result<Option<Delivery>, BrokerError> {
        self.check()?;
        let notified = self.hub.request_ready.notified();
        let queued = self.hub.requests.lock().unwrap().pop_front();
        if let Some(delivery) = queued {
            return Ok(Some(delivery));
        }
        let _ = tokio::time::timeout(Duration::from_millis(50), notified).await;
        self.check()?;
        Ok(self.hub.requests.lock().unwrap().pop_front())
    }

    async fn publish(
        &self,
        reply_to: &str,
        correlation_id: Option<String>,
        body: Vec<u8>,
    ) -> Result<(), BrokerError> {
        self.check()?;
        self.hub.replies.lock().unwrap().push_back(PublishedReply {
            reply_to: reply_to.to_string(),
            correlation_id,
            body,
        });
        self.hub.reply_ready.notify_one();
        Ok(())
    }

    async fn ack(&self, tag: &DeliveryTag) -> Result<(), BrokerError> {
        self.check()?;
        self.hub.acks.lock().unwrap().push(tag.clone());
        Ok(())
    }

    async fn recover(&self) -> Result<usize, BrokerError> {
        Ok(0)
    }
}
