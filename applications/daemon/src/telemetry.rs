//! Tracing setup
//!
//! Console output always goes through the `fmt` layer. When database
//! logging is enabled a [`DbLogLayer`] is installed next to it and the
//! returned [`LogSink`] must be handed to the daemon, which drains it into
//! the logs database.

use crate::config::LoggingSettings;
use crate::error::{DaemonError, Result};
use soulspot_storage::logs::{log_channel, LogRecord};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Receiving end of the database log layer
pub struct LogSink {
    pub receiver: mpsc::Receiver<LogRecord>,
    /// Shared with the installed layer
    pub dropped: Arc<AtomicU64>,
}

impl LogSink {
    /// Records lost because the writer fell behind
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

fn env_filter(default_directive: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(default_directive).map_err(|e| {
            DaemonError::Telemetry(format!("bad log level {default_directive:?}: {e}"))
        }),
    }
}

/// Install the global subscriber
///
/// `RUST_LOG` wins over `settings.level`. With `persist` unset (one-shot
/// commands) no database layer is installed and `None` is returned.
pub fn init(settings: &LoggingSettings, persist: bool) -> Result<Option<LogSink>> {
    let filter = env_filter(&settings.level)?;

    let (db_layer, sink) = if persist && settings.database {
        let (layer, receiver) = log_channel(settings.channel_capacity);
        let layer = layer.with_min_level(settings.database_level);
        let dropped = layer.dropped_counter();
        (Some(layer), Some(LogSink { receiver, dropped }))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        // Command output owns stdout
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(db_layer)
        .try_init()
        .map_err(|e| DaemonError::Telemetry(e.to_string()))?;

    Ok(sink)
}
