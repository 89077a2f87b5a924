//! Buffered writers for audit rows and server events.
//!
//! Both buffers share one shape: enqueue per call, flush when the batch
//! reaches a size threshold or a timer fires, best-effort flush on
//! shutdown. A failed flush logs and drops the in-flight batch; these are
//! observability records, not correctness state, and must never queue
//! unboundedly.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::context::current_identity;
use crate::db::audit::{ServerEventRow, ToolCallRow};
use crate::db::Database;

/// Size/interval batch buffer over a synchronous sink.
pub struct BatchBuffer<T: Send + 'static> {
    label: &'static str,
    queue: Mutex<Vec<T>>,
    capacity: usize,
    sink: Arc<dyn Fn(&[T]) -> Result<()> + Send + Sync>,
}

impl<T: Send + 'static> BatchBuffer<T> {
    pub fn new(
        label: &'static str,
        capacity: usize,
        sink: Arc<dyn Fn(&[T]) -> Result<()> + Send + Sync>,
    ) -> Self {
        Self {
            label,
            queue: Mutex::new(Vec::new()),
            capacity,
            sink,
        }
    }

    /// Add one item; flushes inline when the batch is full.
    pub async fn enqueue(&self, item: T) {
        let batch = {
            let mut queue = self.queue.lock().await;
            queue.push(item);
            if queue.len() >= self.capacity {
                Some(std::mem::take(&mut *queue))
            } else {
                None
            }
        };
        if let Some(batch) = batch {
            self.write(batch);
        }
    }

    /// Drain and write whatever is queued.
    pub async fn flush(&self) {
        let batch = std::mem::take(&mut *self.queue.lock().await);
        if !batch.is_empty() {
            self.write(batch);
        }
    }

    /// Pending item count, for stats.
    pub async fn pending(&self) -> usize {
        self.queue.lock().await.len()
    }

    fn write(&self, batch: Vec<T>) {
        let len = batch.len();
        match (self.sink)(&batch) {
            Ok(()) => debug!(buffer = self.label, rows = len, "flushed batch"),
            // The batch is gone either way.
            Err(e) => warn!(buffer = self.label, rows = len, error = %e, "flush failed, dropping batch"),
        }
    }

    /// Spawn the interval flusher. Runs until `cancel` fires, then performs
    /// one final flush.
    pub fn spawn_flush_loop(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let buffer = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => buffer.flush().await,
                    _ = cancel.cancelled() => {
                        buffer.flush().await;
                        break;
                    }
                }
            }
        })
    }
}

/// Buffered writer for server lifecycle events (10 rows / 5 s).
pub struct EventBuffer {
    inner: Arc<BatchBuffer<ServerEventRow>>,
    enabled: bool,
}

impl EventBuffer {
    pub const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
    const CAPACITY: usize = 10;

    pub fn new(db: Arc<Database>, enabled: bool) -> Self {
        let sink: Arc<dyn Fn(&[ServerEventRow]) -> Result<()> + Send + Sync> =
            Arc::new(move |batch| db.insert_server_events(batch));
        Self {
            inner: Arc::new(BatchBuffer::new("server_events", Self::CAPACITY, sink)),
            enabled,
        }
    }

    /// Record one server event; a no-op when the event log is disabled.
    pub async fn record(&self, row: ServerEventRow) {
        if self.enabled {
            self.inner.enqueue(row).await;
        }
    }

    pub fn spawn_flush_loop(&self, cancel: CancellationToken) -> JoinHandle<()> {
        self.inner.spawn_flush_loop(Self::FLUSH_INTERVAL, cancel)
    }

    pub async fn shutdown(&self) {
        self.inner.flush().await;
    }
}

/// Buffered writer for tool-call audit rows (20 rows / 10 s).
///
/// Sanitization happens at enqueue: when argument or response logging is
/// off, the field is nulled before the row ever reaches the queue.
pub struct AuditBuffer {
    inner: Arc<BatchBuffer<ToolCallRow>>,
    enabled: bool,
    log_arguments: bool,
    log_responses: bool,
}

impl AuditBuffer {
    pub const FLUSH_INTERVAL: Duration = Duration::from_secs(10);
    const CAPACITY: usize = 20;

    pub fn new(db: Arc<Database>, enabled: bool, log_arguments: bool, log_responses: bool) -> Self {
        let sink: Arc<dyn Fn(&[ToolCallRow]) -> Result<()> + Send + Sync> =
            Arc::new(move |batch| db.insert_tool_calls(batch));
        Self {
            inner: Arc::new(BatchBuffer::new("tool_calls", Self::CAPACITY, sink)),
            enabled,
            log_arguments,
            log_responses,
        }
    }

    /// Record one audited call, stamping the ambient request identity.
    pub async fn record(&self, mut row: ToolCallRow) {
        if !self.enabled {
            return;
        }
        if !self.log_arguments {
            row.arguments = None;
        }
        if !self.log_responses {
            row.response = None;
        }
        let identity = current_identity();
        row.api_key_prefix = row.api_key_prefix.or_else(|| identity.api_key_prefix());
        row.user_id = row.user_id.or(identity.user_id);
        row.user_email = row.user_email.or(identity.user_email);
        self.inner.enqueue(row).await;
    }

    pub fn spawn_flush_loop(&self, cancel: CancellationToken) -> JoinHandle<()> {
        self.inner.spawn_flush_loop(Self::FLUSH_INTERVAL, cancel)
    }

    pub async fn shutdown(&self) {
        self.inner.flush().await;
    }
}
