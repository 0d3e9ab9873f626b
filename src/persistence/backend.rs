//! Storage backend trait
//!
//! The core never blocks on storage: it emits [`PersistenceOp`]s through the
//! write-behind queue and only calls the load methods once, at startup.

use async_trait::async_trait;

use super::error::Result;
use super::models::{LoadedData, StoredRetainedMessage, StoredSession};

/// One durable mutation, batched by the background writer
#[derive(Debug, Clone)]
pub enum PersistenceOp {
    /// Upsert a session
    SetSession { session: StoredSession },
    /// Delete a session
    DeleteSession { session_id: String },
    /// Upsert a retained message
    SetRetained {
        topic: String,
        message: StoredRetainedMessage,
    },
    /// Delete a retained message
    DeleteRetained { topic: String },
}

/// Durable storage for sessions and retained messages
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Load all sessions at startup
    async fn load_sessions(&self) -> Result<Vec<StoredSession>>;

    /// Load all retained messages at startup
    async fn load_retained(&self) -> Result<Vec<StoredRetainedMessage>>;

    /// Apply a batch of operations atomically
    async fn batch_write(&self, ops: Vec<PersistenceOp>) -> Result<()>;

    /// Flush all pending writes to stable storage
    async fn flush(&self) -> Result<()>;

    /// Flush and release resources
    async fn close(&self) -> Result<()>;

    /// Load everything at startup
    async fn load_all(&self) -> Result<LoadedData> {
        Ok(LoadedData {
            sessions: self.load_sessions().await?,
            retained: self.load_retained().await?,
        })
    }
}
