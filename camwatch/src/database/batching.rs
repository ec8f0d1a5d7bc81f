//! Write batching for heartbeat persistence.
//!
//! A single background task drains a bounded queue and flushes either when a
//! batch is full or when the flush interval elapses. Producers never wait:
//! a full queue drops the item.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::database::models::HeartbeatRecord;
use crate::database::repositories::HeartbeatStore;

/// Configuration for the batch writer.
#[derive(Debug, Clone)]
pub struct BatchWriterConfig {
    /// Maximum number of items per flush.
    pub max_buffer_size: usize,
    /// Maximum time an item waits before being flushed.
    pub flush_interval: Duration,
    /// Capacity of the queue in front of the flush task.
    pub queue_capacity: usize,
}

impl Default for BatchWriterConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: 64,
            flush_interval: Duration::from_secs(1),
            queue_capacity: 4096,
        }
    }
}

/// A generic batch writer that buffers items and flushes them periodically.
pub struct BatchWriter<T> {
    sender: mpsc::Sender<T>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> BatchWriter<T> {
    /// Create a new batch writer with the given configuration and flush function.
    pub fn new<F, Fut>(config: BatchWriterConfig, flush_fn: F) -> Self
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), crate::Error>> + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel::<T>(config.queue_capacity.max(1));
        let cancel = CancellationToken::new();
        let flush_fn = Arc::new(flush_fn);

        let handle = tokio::spawn(Self::run_flush_loop(
            receiver,
            config,
            flush_fn,
            cancel.clone(),
        ));

        Self {
            sender,
            cancel,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Queue an item without waiting. Returns the item back when the queue
    /// is full or the writer has shut down.
    pub fn try_add(&self, item: T) -> Result<(), TrySendError<T>> {
        self.sender.try_send(item)
    }

    /// Queue an item, waiting for room.
    pub async fn add(&self, item: T) -> Result<(), crate::Error> {
        self.sender
            .send(item)
            .await
            .map_err(|_| crate::Error::Other("Batch writer channel closed".to_string()))
    }

    /// Stop accepting work, flush everything queued and wait for the task.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            error!("Batch writer task failed: {}", e);
        }
    }

    async fn run_flush_loop<F, Fut>(
        mut receiver: mpsc::Receiver<T>,
        config: BatchWriterConfig,
        flush_fn: Arc<F>,
        cancel: CancellationToken,
    ) where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), crate::Error>> + Send + 'static,
    {
        let max = config.max_buffer_size.max(1);
        let mut buffer = Vec::with_capacity(max);
        let mut flush_timer = interval(config.flush_interval);
        flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    receiver.close();
                    while let Some(item) = receiver.recv().await {
                        buffer.push(item);
                        if buffer.len() >= max {
                            if let Err(e) = flush_fn(std::mem::take(&mut buffer)).await {
                                error!("Final batch flush error: {}", e);
                            }
                        }
                    }
                    if !buffer.is_empty() && let Err(e) = flush_fn(buffer).await {
                        error!("Final batch flush error: {}", e);
                    }
                    debug!("Batch writer stopped");
                    break;
                }

                item = receiver.recv() => {
                    match item {
                        Some(item) => {
                            buffer.push(item);

                            if buffer.len() >= max {
                                if let Err(e) = flush_fn(std::mem::take(&mut buffer)).await {
                                    error!("Batch flush error: {}", e);
                                }
                                buffer = Vec::with_capacity(max);
                            }
                        }
                        None => {
                            if !buffer.is_empty() && let Err(e) = flush_fn(buffer).await {
                                error!("Final batch flush error: {}", e);
                            }
                            break;
                        }
                    }
                }

                _ = flush_timer.tick() => {
                    if !buffer.is_empty() {
                        if let Err(e) = flush_fn(std::mem::take(&mut buffer)).await {
                            error!("Periodic batch flush error: {}", e);
                        }
                        buffer = Vec::with_capacity(max);
                    }
                }
            }
        }
    }
}

/// `[storage]` knobs for the heartbeat writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatWriterConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_batch_size() -> usize {
    64
}

fn default_flush_interval_ms() -> u64 {
    1000
}

fn default_queue_capacity() -> usize {
    4096
}

impl Default for HeartbeatWriterConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl From<&HeartbeatWriterConfig> for BatchWriterConfig {
    fn from(config: &HeartbeatWriterConfig) -> Self {
        Self {
            max_buffer_size: config.batch_size,
            flush_interval: Duration::from_millis(config.flush_interval_ms.max(1)),
            queue_capacity: config.queue_capacity,
        }
    }
}

/// Funnels heartbeat records into the store off the scheduling path.
pub struct HeartbeatWriter {
    inner: BatchWriter<HeartbeatRecord>,
    dropped: Arc<AtomicU64>,
}

impl HeartbeatWriter {
    pub fn new(store: Arc<dyn HeartbeatStore>, config: &HeartbeatWriterConfig) -> Self {
        let dropped = Arc::new(AtomicU64::new(0));
        let lost = dropped.clone();
        let inner = BatchWriter::new(config.into(), move |batch: Vec<HeartbeatRecord>| {
            let store = store.clone();
            let lost = lost.clone();
            async move {
                if let Err(e) = store.append_batch(&batch).await {
                    let count = match &e {
                        crate::Error::PartialWrite { lost, .. } => *lost,
                        _ => batch.len(),
                    };
                    lost.fetch_add(count as u64, Ordering::Relaxed);
                    return Err(e);
                }
                Ok(())
            }
        });
        Self { inner, dropped }
    }

    /// Queue a record. Never waits; a full queue drops the record.
    pub fn submit(&self, record: HeartbeatRecord) {
        match self.inner.try_add(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                let err = crate::Error::persistence(&record.stream_name, "write queue full");
                warn!(stream = %record.stream_name, error = %err, "Dropping heartbeat");
            }
            Err(TrySendError::Closed(record)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(stream = %record.stream_name, "Heartbeat writer closed; dropping record");
            }
        }
    }

    /// Records lost to a full queue or a failed batch.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub async fn shutdown(&self) {
        self.inner.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_batch_writer_flush_on_size() {
        let flush_count = Arc::new(AtomicUsize::new(0));
        let flush_count_clone = flush_count.clone();

        let config = BatchWriterConfig {
            max_buffer_size: 3,
            flush_interval: Duration::from_secs(60),
            queue_capacity: 16,
        };

        let writer = BatchWriter::new(config, move |items: Vec<i32>| {
            let count = flush_count_clone.clone();
            async move {
                count.fetch_add(items.len(), Ordering::SeqCst);
                Ok(())
            }
        });

        writer.add(1).await.unwrap();
        writer.add(2).await.unwrap();
        writer.add(3).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(flush_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_writer_flush_on_interval() {
        let flushed = Arc::new(Mutex::new(Vec::new()));
        let sink = flushed.clone();
        let config = BatchWriterConfig {
            max_buffer_size: 100,
            flush_interval: Duration::from_secs(1),
            queue_capacity: 16,
        };
        let writer = BatchWriter::new(config, move |items: Vec<i32>| {
            let sink = sink.clone();
            async move {
                sink.lock().extend(items);
                Ok(())
            }
        });

        writer.try_add(7).unwrap();
        writer.try_add(8).unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(*flushed.lock(), vec![7, 8]);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending() {
        let flushed = Arc::new(AtomicUsize::new(0));
        let sink = flushed.clone();
        let config = BatchWriterConfig {
            max_buffer_size: 1000,
            flush_interval: Duration::from_secs(3600),
            queue_capacity: 1000,
        };
        let writer = BatchWriter::new(config, move |items: Vec<u8>| {
            let sink = sink.clone();
            async move {
                sink.fetch_add(items.len(), Ordering::SeqCst);
                Ok(())
            }
        });
        for i in 0..10 {
            writer.try_add(i).unwrap();
        }
        writer.shutdown().await;
        assert_eq!(flushed.load(Ordering::SeqCst), 10);
        assert!(matches!(writer.try_add(1), Err(TrySendError::Closed(_))));
    }

    #[tokio::test]
    async fn test_try_add_reports_full_queue() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let wait = gate.clone();
        let config = BatchWriterConfig {
            max_buffer_size: 1,
            flush_interval: Duration::from_secs(3600),
            queue_capacity: 1,
        };
        let writer = BatchWriter::new(config, move |_items: Vec<u8>| {
            let wait = wait.clone();
            async move {
                wait.notified().await;
                Ok(())
            }
        });

        // first item is pulled by the loop and blocks in flush
        writer.try_add(1).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        writer.try_add(2).unwrap();
        assert!(matches!(writer.try_add(3), Err(TrySendError::Full(3))));
        gate.notify_waiters();
    }
}
