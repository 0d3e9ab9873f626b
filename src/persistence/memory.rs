//! In-memory storage backend
//!
//! Backs tests and persistence-disabled deployments that still want the
//! restore path exercised. Nothing survives the process.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::backend::{PersistenceOp, StorageBackend};
use super::error::Result;
use super::models::{StoredRetainedMessage, StoredSession};

/// Storage backend keeping everything in process memory
#[derive(Default)]
pub struct MemoryBackend {
    sessions: Mutex<BTreeMap<String, StoredSession>>,
    retained: Mutex<BTreeMap<String, StoredRetainedMessage>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a session directly, bypassing the op queue
    pub fn put_session(&self, session: StoredSession) {
        self.sessions
            .lock()
            .insert(session.session_id.clone(), session);
    }

    /// Seed a retained message directly, bypassing the op queue
    pub fn put_retained(&self, message: StoredRetainedMessage) {
        self.retained.lock().insert(message.topic.clone(), message);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn retained_count(&self) -> usize {
        self.retained.lock().len()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn load_sessions(&self) -> Result<Vec<StoredSession>> {
        Ok(self.sessions.lock().values().cloned().collect())
    }

    async fn load_retained(&self) -> Result<Vec<StoredRetainedMessage>> {
        Ok(self.retained.lock().values().cloned().collect())
    }

    async fn batch_write(&self, ops: Vec<PersistenceOp>) -> Result<()> {
        for op in ops {
            match op {
                PersistenceOp::SetSession { session } => {
                    self.put_session(session);
                }
                PersistenceOp::DeleteSession { session_id } => {
                    self.sessions.lock().remove(&session_id);
                }
                PersistenceOp::SetRetained { topic, message } => {
                    self.retained.lock().insert(topic, message);
                }
                PersistenceOp::DeleteRetained { topic } => {
                    self.retained.lock().remove(&topic);
                }
            }
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
