use super::VaultClient;
use crate::error::{VaultError, VaultResult};
use crate::types::{ArchiveEntry, ArchiveId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct VaultTables {
    archives: HashMap<ArchiveId, ArchiveEntry>,
    order: Vec<ArchiveId>,
    retention: HashMap<ArchiveId, String>,
}

/// Process-local vault. Can be switched offline to simulate an outage.
#[derive(Debug)]
pub struct InMemoryVault {
    tables: Mutex<VaultTables>,
    available: AtomicBool,
    calls: AtomicU64,
}

impl Default for InMemoryVault {
    fn default() -> Self {
        Self {
            tables: Mutex::new(VaultTables::default()),
            available: AtomicBool::new(true),
            calls: AtomicU64::new(0),
        }
    }
}

impl InMemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    /// While unavailable every call fails with a retryable `ConnectionError`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of calls received, successful or not.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.lock().archives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Archived entries in the order they were received.
    pub fn entries(&self) -> Vec<(ArchiveId, ArchiveEntry)> {
        let tables = self.lock();
        tables
            .order
            .iter()
            .filter_map(|id| tables.archives.get(id).map(|e| (id.clone(), e.clone())))
            .collect()
    }

    pub fn retention_policy(&self, archive_id: &str) -> Option<String> {
        self.lock().retention.get(archive_id).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, VaultTables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn begin_call(&self) -> VaultResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(VaultError::ConnectionError("vault offline".to_string()))
        }
    }

    fn insert(&self, tables: &mut VaultTables, entry: &ArchiveEntry) -> ArchiveId {
        let id = format!("arch-{}", uuid::Uuid::new_v4().simple());
        tables.archives.insert(id.clone(), entry.clone());
        tables.order.push(id.clone());
        id
    }
}

#[async_trait]
impl VaultClient for InMemoryVault {
    async fn archive(&self, entry: &ArchiveEntry) -> VaultResult<ArchiveId> {
        self.begin_call()?;
        let mut tables = self.lock();
        Ok(self.insert(&mut tables, entry))
    }

    async fn batch_archive(&self, entries: &[ArchiveEntry]) -> VaultResult<Vec<ArchiveId>> {
        self.begin_call()?;
        let mut tables = self.lock();
        Ok(entries
            .iter()
            .map(|entry| self.insert(&mut tables, entry))
            .collect())
    }

    async fn retrieve(&self, archive_id: &str) -> VaultResult<ArchiveEntry> {
        self.begin_call()?;
        self.lock()
            .archives
            .get(archive_id)
            .cloned()
            .ok_or_else(|| VaultError::NotFound(archive_id.to_string()))
    }

    async fn delete(&self, archive_id: &str) -> VaultResult<()> {
        self.begin_call()?;
        let mut tables = self.lock();
        if tables.archives.remove(archive_id).is_none() {
            return Err(VaultError::NotFound(archive_id.to_string()));
        }
        tables.order.retain(|id| id != archive_id);
        tables.retention.remove(archive_id);
        Ok(())
    }

    async fn apply_retention_policy(&self, archive_id: &str, policy_id: &str) -> VaultResult<()> {
        self.begin_call()?;
        let mut tables = self.lock();
        if !tables.archives.contains_key(archive_id) {
            return Err(VaultError::NotFound(archive_id.to_string()));
        }
        tables
            .retention
            .insert(archive_id.to_string(), policy_id.to_string());
        Ok(())
    }

    async fn health_check(&self) -> VaultResult<bool> {
        self.begin_call()?;
        Ok(true)
    }
}
