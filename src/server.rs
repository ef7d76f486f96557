//! Worker pool and the server driving the broker session.

use crate::broker::{BrokerError, Connector};
use crate::codec::ProtocolVersion;
use crate::context::{BackpressurePolicy, ContextError, WorkerContext};
use crate::renderer::RendererFactory;
use crate::rpc::RpcHandler;
use crate::session::{BrokerSession, Consumer, DisconnectHandler};
use crate::telemetry;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("worker pool needs at least one render worker")]
    NoWorkers,

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("broker connection failed")]
    Broker(#[from] BrokerError),

    #[error("server is shut down")]
    ShutDown,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub worker_name: String,
    pub workers: usize,
    pub queue_capacity: usize,
    pub backpressure: BackpressurePolicy,
    /// Used when a request does not name its protocol version.
    pub default_protocol: ProtocolVersion,
    pub heartbeat_interval: Duration,
}

/// Fixed set of worker contexts with round-robin selection.
pub struct WorkerPool {
    contexts: Vec<WorkerContext>,
    next: AtomicUsize,
    worker_name: String,
}

impl WorkerPool {
    /// Wraps already started contexts.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::NoWorkers` when `contexts` is empty.
    pub fn new(
        worker_name: impl Into<String>,
        contexts: Vec<WorkerContext>,
    ) -> Result<Self, ServerError> {
        if contexts.is_empty() {
            return Err(ServerError::NoWorkers);
        }
        Ok(Self {
            contexts,
            next: AtomicUsize::new(0),
            worker_name: worker_name.into(),
        })
    }

    /// Starts `config.workers` contexts, each with its own renderer.
    pub fn start(config: &ServerConfig, factory: &RendererFactory) -> Result<Self, ServerError> {
        let contexts = (0..config.workers)
            .map(|index| {
                WorkerContext::start(
                    index,
                    config.queue_capacity,
                    config.backpressure,
                    factory(index),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(config.worker_name.clone(), contexts)
    }

    /// Next context in round-robin order. Safe to call concurrently.
    pub fn next_renderer(&self) -> &WorkerContext {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.contexts.len();
        &self.contexts[index]
    }

    /// Stable identity of this process, echoed in every response.
    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    /// All contexts in pool order.
    pub fn contexts(&self) -> &[WorkerContext] {
        &self.contexts
    }

    /// Number of contexts.
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Jobs waiting across all contexts.
    pub fn queued(&self) -> usize {
        self.contexts.iter().map(WorkerContext::queued).sum()
    }

    /// Interrupts every context. Queued jobs are abandoned.
    pub fn interrupt(&self) {
        for context in &self.contexts {
            context.interrupt();
        }
    }

    /// Blocks until every dispatch thread has exited.
    pub fn join(&self) {
        for context in &self.contexts {
            context.join();
        }
    }
}

struct ConsumerHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns the worker pool and keeps a consumer registered on the broker.
pub struct RenderServer {
    pool: Arc<WorkerPool>,
    session: Arc<BrokerSession>,
    connector: Arc<dyn Connector>,
    handler: Arc<RpcHandler>,
    heartbeat_interval: Duration,
    /// Also serializes reconnects.
    consumer: Mutex<Option<ConsumerHandle>>,
    shutdown: CancellationToken,
}

impl RenderServer {
    /// Starts the worker pool and builds a server around it.
    ///
    /// # Arguments
    ///
    /// * `config` - Pool size, queue capacity and protocol defaults
    /// * `connector` - Opens broker channels on start and reconnect
    /// * `factory` - Builds one renderer per context
    ///
    /// # Returns
    ///
    /// The server, not yet connected. Call [`RenderServer::start`] next.
    pub fn new(
        config: &ServerConfig,
        connector: Arc<dyn Connector>,
        factory: &RendererFactory,
    ) -> Result<Arc<Self>, ServerError> {
        let pool = Arc::new(WorkerPool::start(config, factory)?);
        Ok(Self::with_pool(pool, connector, config.default_protocol, config.heartbeat_interval))
    }

    /// Builds a server around an existing pool.
    pub fn with_pool(
        pool: Arc<WorkerPool>,
        connector: Arc<dyn Connector>,
        default_protocol: ProtocolVersion,
        heartbeat_interval: Duration,
    ) -> Arc<Self> {
        let session = Arc::new(BrokerSession::new());
        let handler = Arc::new(RpcHandler::new(pool.clone(), session.clone(), default_protocol));
        Arc::new(Self {
            pool,
            session,
            connector,
            handler,
            heartbeat_interval,
            consumer: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn worker_name(&self) -> &str {
        self.pool.worker_name()
    }

    /// Next context in round-robin order.
    pub fn next_renderer(&self) -> &WorkerContext {
        self.pool.next_renderer()
    }

    /// Connects, registers the consumer and starts the heartbeat.
    pub async fn start(self: &Arc<Self>) -> Result<(), ServerError> {
        self.connect(&mut *self.consumer.lock().await, true).await?;
        self.spawn_heartbeat();
        info!(
            worker = self.worker_name(),
            workers = self.pool.len(),
            "Render server started"
        );
        Ok(())
    }

    /// Tears down the broker channel and registers a fresh consumer.
    ///
    /// Returns immediately when another reconnect is already running.
    pub async fn reconnect(self: &Arc<Self>) -> Result<(), ServerError> {
        let Ok(mut consumer) = self.consumer.try_lock() else {
            debug!("Reconnect already in progress");
            return Ok(());
        };
        info!(worker = self.worker_name(), "Reconnecting to broker");
        self.connect(&mut consumer, false).await
    }

    /// Deliveries still in flight keep their claim across a reconnect, so
    /// unacknowledged work is only requeued on the first connect.
    async fn connect(
        self: &Arc<Self>,
        consumer: &mut Option<ConsumerHandle>,
        recover: bool,
    ) -> Result<(), ServerError> {
        if self.shutdown.is_cancelled() {
            return Err(ServerError::ShutDown);
        }
        if let Some(old) = consumer.take() {
            old.token.cancel();
        }

        let channel = self.connector.connect().await?;
        if recover {
            channel.recover().await?;
        }
        self.session.replace_channel(channel.clone());

        let token = self.shutdown.child_token();
        let task = self.session.spawn_consumer(
            channel,
            Consumer {
                delivery: self.handler.clone(),
                disconnect: Arc::new(ReconnectOnDisconnect {
                    server: Arc::downgrade(self),
                }),
            },
            token.clone(),
        );
        *consumer = Some(ConsumerHandle { token, task });
        Ok(())
    }

    fn spawn_heartbeat(self: &Arc<Self>) {
        if self.heartbeat_interval.is_zero() {
            return;
        }
        let pool = self.pool.clone();
        let token = self.shutdown.child_token();
        let interval = self.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        telemetry::record_worker_heartbeat(pool.worker_name(), pool.queued());
                    }
                }
            }
        });
    }

    /// Stops consuming and interrupts every worker. Queued jobs are
    /// abandoned and stay unacknowledged on the broker.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(consumer) = self.consumer.lock().await.take() {
            consumer.token.cancel();
            if let Err(e) = consumer.task.await {
                warn!(error = %e, "Consumer task ended abnormally");
            }
        }

        self.pool.interrupt();
        let pool = self.pool.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || pool.join()).await {
            error!(error = %e, "Failed to join render workers");
        }
        info!(worker = self.worker_name(), "Render server stopped");
    }
}

/// Reconnects the server when its consumer loses the broker.
struct ReconnectOnDisconnect {
    server: Weak<RenderServer>,
}

impl DisconnectHandler for ReconnectOnDisconnect {
    fn handle_disconnect(&self, err: &BrokerError) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        warn!(error = %err, "Broker connection lost");
        tokio::spawn(async move {
            if let Err(e) = server.reconnect().await {
                error!(error = %e, "Reconnect failed");
            }
        });
    }
}
