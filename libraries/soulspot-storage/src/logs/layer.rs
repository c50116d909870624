use super::{LogLevel, LogRecord, LogStore};
use serde_json::json;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::field::{Field, Visit};
use tracing::{error, info, Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

/// Targets never forwarded to the logs database; their events are produced
/// while writing log records.
const IGNORED_TARGETS: &[&str] = &["sqlx", "soulspot_storage::logs"];

/// Create a [`DbLogLayer`] and the receiver a [`LogWriter`] consumes
pub fn log_channel(capacity: usize) -> (DbLogLayer, mpsc::Receiver<LogRecord>) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (
        DbLogLayer {
            sender,
            min_level: LogLevel::Info,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        receiver,
    )
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
}

impl FieldVisitor {
    fn record_value(&mut self, field: &Field, value: serde_json::Value) {
        if field.name() == "message" {
            self.message = Some(match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            });
            return;
        }

        self.fields.insert(field.name().to_string(), value);
    }
}

impl Visit for FieldVisitor {
    fn record_f64(&mut self, field: &Field, value: f64) {
        self.record_value(field, json!(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.record_value(field, json!(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.record_value(field, json!(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.record_value(field, json!(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_value(field, json!(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn Debug) {
        self.record_value(field, json!(format!("{:?}", value)));
    }
}

/// `tracing` layer forwarding events to the logs database
///
/// `on_event` only builds a [`LogRecord`] and `try_send`s it. When the
/// channel is full the record is dropped and counted.
#[derive(Debug, Clone)]
pub struct DbLogLayer {
    sender: mpsc::Sender<LogRecord>,
    min_level: LogLevel,
    dropped: Arc<AtomicU64>,
}

impl DbLogLayer {
    /// Only forward events at `level` or more severe
    pub fn with_min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Records lost because the channel was full or closed
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Shared drop counter, still readable after the layer is installed
    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dropped)
    }

    fn is_ignored(target: &str) -> bool {
        IGNORED_TARGETS
            .iter()
            .any(|prefix| target.starts_with(prefix))
    }
}

impl<S> Layer<S> for DbLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let level = LogLevel::from(metadata.level());
        if level < self.min_level || Self::is_ignored(metadata.target()) {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let record = LogRecord {
            timestamp: chrono::Utc::now(),
            level,
            target: metadata.target().to_string(),
            message: visitor
                .message
                .unwrap_or_else(|| metadata.name().to_string()),
            fields: (!visitor.fields.is_empty()).then(|| serde_json::Value::Object(visitor.fields)),
        };

        // Never call `tracing::*` here; it would recurse.
        if self.sender.try_send(record).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Batching parameters for [`LogWriter`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogWriterConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
}

impl Default for LogWriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval: Duration::from_secs(1),
        }
    }
}

/// Background task draining [`DbLogLayer`] records into a [`LogStore`]
pub struct LogWriter {
    store: LogStore,
    receiver: mpsc::Receiver<LogRecord>,
    config: LogWriterConfig,
}

impl LogWriter {
    pub fn new(
        store: LogStore,
        receiver: mpsc::Receiver<LogRecord>,
        config: LogWriterConfig,
    ) -> Self {
        Self {
            store,
            receiver,
            config,
        }
    }

    /// Run until `shutdown` is cancelled or every sender is gone
    ///
    /// Records still queued at shutdown are written before the task ends.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(mut self, shutdown: CancellationToken) {
        let batch_size = self.config.batch_size.max(1);
        let mut batch = Vec::with_capacity(batch_size);
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut written = 0usize;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.receiver.recv() => match received {
                    Some(record) => {
                        batch.push(record);
                        if batch.len() >= batch_size {
                            written += self.write(&mut batch).await;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if !batch.is_empty() {
                        written += self.write(&mut batch).await;
                    }
                }
            }
        }

        while let Ok(record) = self.receiver.try_recv() {
            batch.push(record);
            if batch.len() >= batch_size {
                written += self.write(&mut batch).await;
            }
        }
        written += self.write(&mut batch).await;

        info!(written, "Log writer stopped");
    }

    async fn write(&self, batch: &mut Vec<LogRecord>) -> usize {
        if batch.is_empty() {
            return 0;
        }

        let result = self.store.insert_batch(batch).await;
        let count = batch.len();
        batch.clear();

        match result {
            Ok(written) => written,
            Err(e) => {
                error!(count, error = %e, "Failed to write log batch, records lost");
                0
            }
        }
    }
}
