//! Fjall-based storage backend
//!
//! Uses fjall (an LSM-tree embedded database) with one partition per record
//! kind. Values are bincode-encoded models.

use std::path::Path;

use async_trait::async_trait;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use super::backend::{PersistenceOp, StorageBackend};
use super::error::{PersistenceError, Result};
use super::models::{StoredRetainedMessage, StoredSession};

/// Fjall-backed durable storage
pub struct FjallBackend {
    keyspace: Keyspace,
    sessions: PartitionHandle,
    retained: PartitionHandle,
}

impl FjallBackend {
    /// Open (or create) a keyspace at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let keyspace = Config::new(path).open()?;

        let sessions = keyspace.open_partition("sessions", PartitionCreateOptions::default())?;
        let retained = keyspace.open_partition("retained", PartitionCreateOptions::default())?;

        Ok(Self {
            keyspace,
            sessions,
            retained,
        })
    }

    fn serialize<T: bincode::Encode>(value: &T) -> Result<Vec<u8>> {
        bincode::encode_to_vec(value, bincode::config::standard()).map_err(PersistenceError::from)
    }

    fn deserialize<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T> {
        bincode::decode_from_slice(bytes, bincode::config::standard())
            .map(|(value, _)| value)
            .map_err(PersistenceError::from)
    }
}

#[async_trait]
impl StorageBackend for FjallBackend {
    async fn load_sessions(&self) -> Result<Vec<StoredSession>> {
        let mut result = Vec::new();
        for item in self.sessions.iter() {
            let (_, value) = item?;
            result.push(Self::deserialize(&value)?);
        }
        Ok(result)
    }

    async fn load_retained(&self) -> Result<Vec<StoredRetainedMessage>> {
        let mut result = Vec::new();
        for item in self.retained.iter() {
            let (_, value) = item?;
            result.push(Self::deserialize(&value)?);
        }
        Ok(result)
    }

    async fn batch_write(&self, ops: Vec<PersistenceOp>) -> Result<()> {
        let mut batch = self.keyspace.batch();

        for op in ops {
            match op {
                PersistenceOp::SetSession { session } => {
                    let bytes = Self::serialize(&session)?;
                    batch.insert(&self.sessions, session.session_id, bytes);
                }
                PersistenceOp::DeleteSession { session_id } => {
                    batch.remove(&self.sessions, session_id);
                }
                PersistenceOp::SetRetained { topic, message } => {
                    let bytes = Self::serialize(&message)?;
                    batch.insert(&self.retained, topic, bytes);
                }
                PersistenceOp::DeleteRetained { topic } => {
                    batch.remove(&self.retained, topic);
                }
            }
        }

        batch.commit()?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // fjall handles cleanup on drop
        self.flush().await
    }
}
