//! Logging subsystem
//!
//! Structured logging via tracing with JSON (production) and plaintext
//! (development) output formats.
//!
//! # Log Targets
//!
//! Use these consistent target names across the codebase:
//! - `server` - HTTP server and route handlers
//! - `auth` - authentication middleware
//! - `envelope` - transport decryption middleware
//! - `sessions` - session store and cleanup
//! - `repo` - repo manager and per-repo locking
//! - `git` - git subprocess invocations
//! - `storage` - file store
//!
//! # Environment Variables
//!
//! - `DRAWBRIDGE_LOG` - Primary log level/filter (takes precedence)
//! - `RUST_LOG` - Fallback log level/filter
//! - `LOG_FORMAT` - `json` or `plaintext` (default)

use std::sync::OnceLock;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Guard to track if logging has been initialized
static INIT_GUARD: OnceLock<()> = OnceLock::new();

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// JSON format for production (structured logs)
    Json,
    /// Human-readable plaintext for development
    #[default]
    Plaintext,
}

impl LogFormat {
    fn from_env() -> Self {
        match std::env::var("LOG_FORMAT").as_deref() {
            Ok("json") => Self::Json,
            _ => Self::Plaintext,
        }
    }
}

/// Configuration for the logging subsystem
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Output format (JSON or plaintext)
    pub format: LogFormat,
    /// Default log level when no env filter is set
    pub default_level: Level,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Plaintext,
            default_level: Level::INFO,
        }
    }
}

/// Build the env filter: `DRAWBRIDGE_LOG` wins, then `RUST_LOG`, then the
/// configured default level.
fn build_env_filter(default_level: Level) -> EnvFilter {
    EnvFilter::try_from_env("DRAWBRIDGE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()))
}

/// Initialize the global tracing subscriber. Idempotent: a second call is a
/// no-op so tests can initialize freely.
pub fn init_logging(config: LogConfig) {
    if INIT_GUARD.set(()).is_err() {
        return;
    }

    let filter = build_env_filter(config.default_level);
    let layer = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .boxed(),
        LogFormat::Plaintext => tracing_subscriber::fmt::layer().with_target(true).boxed(),
    };

    tracing_subscriber::registry().with(filter).with(layer).init();
}

/// Initialize logging from `LOG_FORMAT` / `DRAWBRIDGE_LOG` / `RUST_LOG`.
pub fn init_from_env() {
    init_logging(LogConfig {
        format: LogFormat::from_env(),
        ..LogConfig::default()
    });
}
