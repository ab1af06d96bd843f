//! # DHT Telemetry
//!
//! Logging and metrics for DHT peers.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use dht_telemetry::{init_telemetry, TelemetryConfig};
//!
//! let _guard = init_telemetry(TelemetryConfig::from_env())?;
//! // logs and metrics are collected until the guard drops
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `DHT_SERVICE_NAME` | `dht-node` | Service name in logs |
//! | `DHT_LOG_LEVEL` | `info` | Log level filter (`RUST_LOG` also honoured) |
//! | `DHT_CONSOLE_OUTPUT` | `true` | Write logs to stdout |
//! | `DHT_JSON_LOGS` | `false` | JSON log lines |
//! | `DHT_METRICS_PORT` | `9100` | Prometheus port |
//! | `DHT_NETWORK` | `local` | Network name |

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod config;
mod logging;
pub mod metrics;

pub use config::TelemetryConfig;
pub use metrics::{
    encode_metrics, register_metrics, HistogramTimer, CHANNELS_CLOSED, CHANNELS_OPENED,
    DECODE_FAULTS, MESSAGES_DISPATCHED, MESSAGES_REJECTED, REQUESTS_FAILED, REQUESTS_SENT,
    REQUEST_LATENCY, RESERVATION_IN_USE,
};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to initialize logging: {0}")]
    LoggingInit(String),

    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Initialize logging and metrics.
///
/// Returns a guard that must be held for the lifetime of the application.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    // Metrics first, they do not depend on the subscriber
    register_metrics()?;
    logging::init_logging(&config)?;

    Ok(TelemetryGuard {
        service_name: config.service_name,
    })
}

/// Guard that keeps telemetry active.
pub struct TelemetryGuard {
    service_name: String,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        tracing::info!(service = %self.service_name, "Shutting down telemetry");
    }
}

/// Increment a counter, optionally with label values.
#[macro_export]
macro_rules! metric_inc {
    ($metric:expr) => {
        $metric.inc()
    };
    ($metric:expr, $labels:expr) => {
        $metric.with_label_values($labels).inc()
    };
}
