use super::store::{SessionRecord, SessionStore};
use crate::core::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// In-process session store for single-node deployments and tests
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    records: RwLock<HashMap<String, SessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, session_id: &str) -> Option<SessionRecord> {
        self.records.read().await.get(session_id).cloned()
    }

    /// Number of stored records, expired ones included
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn upsert(&self, record: SessionRecord) -> Result<()> {
        self.records
            .write()
            .await
            .insert(record.session_id.clone(), record);
        Ok(())
    }

    async fn count_active(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .filter(|record| record.last_activity >= cutoff)
            .count() as u64)
    }

    async fn delete_expired(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| record.last_activity >= cutoff);
        Ok((before - records.len()) as u64)
    }
}
