//! Persistence facade
//!
//! The core's durable side-channel: sessions and retained messages are
//! written behind a bounded queue by a background task, and read back once at
//! startup. A full queue drops the operation with a warning; durability is
//! best-effort by design and never blocks the routing core.

mod backend;
mod error;
mod fjall;
mod memory;
mod models;

pub use backend::{PersistenceOp, StorageBackend};
pub use error::{PersistenceError, Result};
pub use fjall::FjallBackend;
pub use memory::MemoryBackend;
pub use models::{
    LoadedData, StoredProperties, StoredPublish, StoredRetainedMessage, StoredSession,
    StoredSubscription, StoredWill,
};

pub(crate) use models::{system_time_to_unix_secs, unix_secs_to_system_time};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Write-behind queue bound; overflow drops operations
const OP_QUEUE_BOUND: usize = 100;

/// Cheap handle the core uses to emit operations.
///
/// A disabled handle swallows everything, so call sites never branch on
/// whether persistence is configured.
#[derive(Clone)]
pub struct PersistenceHandle {
    tx: Option<mpsc::Sender<PersistenceOp>>,
}

impl PersistenceHandle {
    /// A handle that discards every operation
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Fire-and-forget write; a full queue drops the operation
    pub fn store(&self, op: PersistenceOp) {
        let Some(tx) = &self.tx else { return };
        if let Err(e) = tx.try_send(op) {
            warn!("persistence queue full, dropping operation: {}", e);
        }
    }
}

/// Owns the background writer and the backend
pub struct PersistenceManager {
    backend: Arc<dyn StorageBackend>,
    tx: mpsc::Sender<PersistenceOp>,
    shutdown_tx: mpsc::Sender<()>,
}

impl PersistenceManager {
    /// Spawn the background writer over the given backend
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        flush_interval: Duration,
        max_batch_size: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(OP_QUEUE_BOUND);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let writer_backend = backend.clone();
        tokio::spawn(Self::writer_loop(
            writer_backend,
            rx,
            shutdown_rx,
            flush_interval,
            max_batch_size,
        ));

        Self {
            backend,
            tx,
            shutdown_tx,
        }
    }

    /// Handle for the core to emit operations through
    pub fn handle(&self) -> PersistenceHandle {
        PersistenceHandle {
            tx: Some(self.tx.clone()),
        }
    }

    /// Load all data at startup
    pub async fn load_all(&self) -> Result<LoadedData> {
        self.backend.load_all().await
    }

    /// Stop the writer, flush pending batches, and close the backend
    pub async fn shutdown(&self) -> Result<()> {
        info!("shutting down persistence");
        let _ = self.shutdown_tx.send(()).await;

        // Give the writer a moment to flush its final batch
        tokio::time::sleep(Duration::from_millis(200)).await;

        self.backend.flush().await?;
        self.backend.close().await
    }

    async fn writer_loop(
        backend: Arc<dyn StorageBackend>,
        mut rx: mpsc::Receiver<PersistenceOp>,
        mut shutdown_rx: mpsc::Receiver<()>,
        flush_interval: Duration,
        max_batch_size: usize,
    ) {
        let mut batch = Vec::with_capacity(max_batch_size);
        let mut interval = tokio::time::interval(flush_interval);

        loop {
            tokio::select! {
                op = rx.recv() => {
                    match op {
                        Some(op) => {
                            batch.push(op);
                            if batch.len() >= max_batch_size {
                                Self::commit(&backend, &mut batch, "max batch").await;
                            }
                        }
                        None => {
                            Self::commit(&backend, &mut batch, "channel closed").await;
                            break;
                        }
                    }
                }
                _ = interval.tick() => {
                    Self::commit(&backend, &mut batch, "interval").await;
                }
                _ = shutdown_rx.recv() => {
                    // Drain whatever is already queued before exiting
                    while let Ok(op) = rx.try_recv() {
                        batch.push(op);
                    }
                    Self::commit(&backend, &mut batch, "shutdown").await;
                    break;
                }
            }
        }

        debug!("persistence writer exited");
    }

    async fn commit(backend: &Arc<dyn StorageBackend>, batch: &mut Vec<PersistenceOp>, why: &str) {
        if batch.is_empty() {
            return;
        }
        let count = batch.len();
        if let Err(e) = backend.batch_write(std::mem::take(batch)).await {
            error!("failed to write batch of {}: {}", count, e);
        } else {
            debug!("flushed {} operations ({})", count, why);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn retained(topic: &str) -> StoredRetainedMessage {
        StoredRetainedMessage {
            topic: topic.to_string(),
            payload: vec![1, 2, 3],
            qos: 1,
            properties: StoredProperties::default(),
            stored_at_secs: system_time_to_unix_secs(SystemTime::now()),
            expires_at_secs: None,
        }
    }

    #[tokio::test]
    async fn memory_backend_batch_write_and_load() {
        let backend = MemoryBackend::new();

        backend
            .batch_write(vec![
                PersistenceOp::SetRetained {
                    topic: "topic1".to_string(),
                    message: retained("topic1"),
                },
                PersistenceOp::SetRetained {
                    topic: "topic2".to_string(),
                    message: retained("topic2"),
                },
                PersistenceOp::DeleteRetained {
                    topic: "topic1".to_string(),
                },
            ])
            .await
            .unwrap();

        let loaded = backend.load_all().await.unwrap();
        assert_eq!(loaded.retained.len(), 1);
        assert_eq!(loaded.retained[0].topic, "topic2");
    }

    #[tokio::test]
    async fn fjall_backend_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FjallBackend::open(dir.path()).unwrap();

        let session = StoredSession {
            session_id: "client-1".to_string(),
            receive_maximum: 10,
            subscriptions: vec![StoredSubscription {
                filter: "sensors/#".to_string(),
                qos: 1,
                no_local: false,
                retain_as_published: false,
                retain_handling: 0,
            }],
            qos_pending: Vec::new(),
            will: None,
            expires_at_secs: None,
        };

        backend
            .batch_write(vec![
                PersistenceOp::SetSession { session },
                PersistenceOp::SetRetained {
                    topic: "status".to_string(),
                    message: retained("status"),
                },
            ])
            .await
            .unwrap();

        let loaded = backend.load_all().await.unwrap();
        assert_eq!(loaded.sessions.len(), 1);
        assert_eq!(loaded.sessions[0].session_id, "client-1");
        assert_eq!(loaded.sessions[0].subscriptions[0].filter, "sensors/#");
        assert_eq!(loaded.retained.len(), 1);

        backend
            .batch_write(vec![PersistenceOp::DeleteSession {
                session_id: "client-1".to_string(),
            }])
            .await
            .unwrap();
        assert!(backend.load_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn manager_writes_behind() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = PersistenceManager::new(
            backend.clone(),
            Duration::from_millis(10),
            8,
        );
        let handle = manager.handle();

        handle.store(PersistenceOp::SetRetained {
            topic: "t".to_string(),
            message: retained("t"),
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(backend.retained_count(), 1);

        manager.shutdown().await.unwrap();
    }
}
