//! Environment configuration.
//!
//! | variable                  | default                 |
//! |---------------------------|-------------------------|
//! | `REDIS_URL`               | `redis://127.0.0.1/`    |
//! | `RENDER_REQUEST_QUEUE`    | `skinrender:requests`   |
//! | `RENDER_WORKERS`          | available parallelism   |
//! | `RENDER_QUEUE_CAPACITY`   | `64`                    |
//! | `RENDER_BACKPRESSURE`     | `block` (or `reject`)   |
//! | `RENDER_WORKER_NAME`      | `{HOSTNAME}-{uuid8}`    |
//! | `RENDER_PROTOCOL_VERSION` | `2`                     |
//! | `RENDER_REPLY_TTL_SECS`   | `60`                    |
//! | `RENDER_POLL_TIMEOUT_SECS`| `5`                     |
//! | `RENDER_HEARTBEAT_SECS`   | `30` (`0` disables)     |

use crate::broker::RedisBrokerConfig;
use crate::codec::ProtocolVersion;
use crate::context::BackpressurePolicy;
use crate::server::ServerConfig;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub redis_url: String,
    pub request_queue: String,
    pub workers: usize,
    pub queue_capacity: usize,
    pub backpressure: BackpressurePolicy,
    pub worker_name: String,
    pub protocol: ProtocolVersion,
    pub reply_ttl_secs: u64,
    pub poll_timeout_secs: f64,
    pub heartbeat_secs: u64,
}

impl WorkerConfig {
    /// Reads the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads configuration through `lookup`; missing keys take defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let default_workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        let workers = parse(&lookup, "RENDER_WORKERS", default_workers)?;
        if workers == 0 {
            return Err(invalid("RENDER_WORKERS", "0", "must be at least 1"));
        }

        let backpressure = match lookup("RENDER_BACKPRESSURE").as_deref() {
            None | Some("block") => BackpressurePolicy::Block,
            Some("reject") => BackpressurePolicy::Reject,
            Some(other) => {
                return Err(invalid("RENDER_BACKPRESSURE", other, "expected block or reject"))
            }
        };

        let protocol = match lookup("RENDER_PROTOCOL_VERSION") {
            None => ProtocolVersion::default(),
            Some(value) => value
                .parse::<u8>()
                .ok()
                .and_then(ProtocolVersion::from_u8)
                .ok_or_else(|| invalid("RENDER_PROTOCOL_VERSION", &value, "expected 1 or 2"))?,
        };

        // BLMOVE treats 0 as "block forever" and rejects negative timeouts.
        let poll_timeout_secs: f64 = parse(&lookup, "RENDER_POLL_TIMEOUT_SECS", 5.0)?;
        if !poll_timeout_secs.is_finite() || poll_timeout_secs <= 0.0 {
            return Err(invalid(
                "RENDER_POLL_TIMEOUT_SECS",
                &poll_timeout_secs.to_string(),
                "must be a positive number of seconds",
            ));
        }

        // EXPIRE 0 would delete every reply as it is pushed.
        let reply_ttl_secs: u64 = parse(&lookup, "RENDER_REPLY_TTL_SECS", 60)?;
        if reply_ttl_secs == 0 {
            return Err(invalid("RENDER_REPLY_TTL_SECS", "0", "must be at least 1"));
        }

        let worker_name = lookup("RENDER_WORKER_NAME").unwrap_or_else(|| {
            let host = lookup("HOSTNAME").unwrap_or_else(|| "render".to_string());
            let id = Uuid::new_v4().simple().to_string();
            format!("{}-{}", host, &id[..8])
        });

        Ok(Self {
            redis_url: lookup("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1/".to_string()),
            request_queue: lookup("RENDER_REQUEST_QUEUE")
                .unwrap_or_else(|| "skinrender:requests".to_string()),
            workers,
            queue_capacity: parse(&lookup, "RENDER_QUEUE_CAPACITY", 64)?,
            backpressure,
            worker_name,
            protocol,
            reply_ttl_secs,
            poll_timeout_secs,
            heartbeat_secs: parse(&lookup, "RENDER_HEARTBEAT_SECS", 30)?,
        })
    }

    /// Settings for the worker pool and server.
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            worker_name: self.worker_name.clone(),
            workers: self.workers,
            queue_capacity: self.queue_capacity,
            backpressure: self.backpressure,
            default_protocol: self.protocol,
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
        }
    }

    /// Settings for the Redis transport.
    pub fn broker_config(&self) -> RedisBrokerConfig {
        RedisBrokerConfig {
            request_queue: self.request_queue.clone(),
            worker_name: self.worker_name.clone(),
            reply_ttl_secs: self.reply_ttl_secs,
            poll_timeout_secs: self.poll_timeout_secs,
        }
    }
}

fn parse<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(key, &value, &e.to_string())),
    }
}

fn invalid(key: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
