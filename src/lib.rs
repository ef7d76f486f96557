//! Skin Render Worker Library
//!
//! Serves skin render requests arriving over a Redis request/reply queue
//! with a fixed pool of serialized render workers.
//!
//! ## Module Overview
//!
//! - `job`: render request, job and completion handle
//! - `codec`: binary request/response wire format
//! - `context`: one render worker with its own queue and thread
//! - `server`: worker pool, round-robin dispatch and reconnect
//! - `session` / `rpc` / `broker`: consuming requests and publishing replies
//! - `renderer`: the renderer seam and the bundled skin renderer
//! - `local`: rendering without a broker, with a bounded wait
//! - `client`: sending requests and awaiting replies
//! - `telemetry`: OpenTelemetry integration and structured logging
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use skin_render_worker::{
//!     context::{BackpressurePolicy, WorkerContext},
//!     job::{RenderMode, RenderRequest},
//!     local::render_blocking,
//!     renderer::SkinRenderer,
//! };
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let context =
//!         WorkerContext::start(0, 16, BackpressurePolicy::Block, Box::new(SkinRenderer::new()))
//!             .unwrap();
//!
//!     let texture = std::fs::read("skin.png").unwrap();
//!     let request = RenderRequest {
//!         mode: RenderMode::Body,
//!         width: 128,
//!         height: 256,
//!         source_image: skin_render_worker::codec::decode_png(&texture).unwrap(),
//!         rotation_x: 0,
//!         rotation_y: 30,
//!         leg_rotation: 10,
//!         flipped: false,
//!         slim: false,
//!     };
//!
//!     let image = render_blocking(&context, request, Duration::from_secs(5)).await;
//!     assert!(image.is_ok());
//! }
//! ```

pub mod broker;
pub mod client;
pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod job;
pub mod local;
pub mod renderer;
pub mod rpc;
pub mod server;
pub mod session;
pub mod telemetry;
