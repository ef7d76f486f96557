//! Skin Render Worker Service
//!
//! Consumes render requests from a Redis list, renders them on a pool of
//! worker threads and pushes each response to the requester's reply list.
//!
//! ## Architecture
//!
//! - **Requests**: Redis list (`skinrender:requests`), JSON envelopes
//! - **Claims**: per-worker processing list, acknowledged after reply
//! - **Renderer**: tiny-skia front-view skin renderer
//! - **Telemetry**: OpenTelemetry OTLP export
//!
//! See `config` for the environment variables read at startup.
//!
//! `skin-render-worker --render <skin.png> <out.png> [width height]` renders
//! one texture locally without Redis.

use anyhow::{bail, Context, Result};
use skin_render_worker::{
    broker::RedisConnector,
    codec,
    config::WorkerConfig,
    context::{BackpressurePolicy, WorkerContext},
    job::{RenderMode, RenderRequest},
    local,
    renderer::{Renderer, RendererFactory, SkinRenderer},
    server::RenderServer,
    telemetry,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const LOCAL_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.first().map(String::as_str) == Some("--render") {
        return render_once(&args[1..]).await;
    }

    if let Err(e) = telemetry::init_telemetry() {
        warn!("Failed to initialize telemetry: {}", e);
    }

    info!("Starting skin render worker service");

    let config = WorkerConfig::from_env().context("Invalid configuration")?;
    info!(
        "Configuration: redis_url={}, queue={}, workers={}, capacity={}, worker_name={}",
        config.redis_url,
        config.request_queue,
        config.workers,
        config.queue_capacity,
        config.worker_name
    );

    let connector = RedisConnector::new(&config.redis_url, config.broker_config())
        .context("Failed to create Redis client")?;
    let factory: RendererFactory =
        Box::new(|_| Box::new(SkinRenderer::new()) as Box<dyn Renderer>);

    let server = RenderServer::new(&config.server_config(), Arc::new(connector), &factory)
        .context("Failed to start render workers")?;
    server
        .start()
        .await
        .context("Failed to connect to Redis")?;

    info!("Worker service ready, press Ctrl+C to shutdown");
    signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;

    info!("Received shutdown signal, stopping workers...");
    server.shutdown().await;

    info!("Worker service shutdown complete");
    Ok(())
}

/// Renders one texture file through a local worker context.
async fn render_once(args: &[String]) -> Result<()> {
    let (input, output) = match args {
        [input, output, ..] => (input, output),
        _ => bail!("usage: --render <skin.png> <out.png> [width height]"),
    };
    let width: u32 =
        args.get(2).map(|v| v.parse()).transpose().context("Invalid width")?.unwrap_or(128);
    let height: u32 =
        args.get(3).map(|v| v.parse()).transpose().context("Invalid height")?.unwrap_or(256);

    let texture = std::fs::read(input).with_context(|| format!("Failed to read {}", input))?;
    let request = RenderRequest {
        mode: RenderMode::Body,
        width,
        height,
        source_image: codec::decode_png(&texture).context("Failed to decode texture")?,
        rotation_x: 0,
        rotation_y: 0,
        leg_rotation: 0,
        flipped: false,
        slim: false,
    };

    let context =
        WorkerContext::start(0, 1, BackpressurePolicy::Reject, Box::new(SkinRenderer::new()))?;
    let result = local::render_blocking(&context, request, LOCAL_TIMEOUT).await;
    context.interrupt();

    let image = result.context("Render did not complete")?;
    let png = codec::encode_png(&image)?;
    std::fs::write(output, &png).with_context(|| format!("Failed to write {}", output))?;

    info!("Rendered {} -> {} ({}x{})", input, output, width, height);
    Ok(())
}
