#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use vault_adapter::config::SecretValue;
use vault_adapter::{
    AdapterStats, AnonymizationStrategy, ArchivalTrigger, ArchiveEntry, Direction,
    DualStorageAdapter, GraphEdge, GraphNode, InMemoryGraphStore, PiiType, StorageBackend,
    StorageConfig, StorageError, StorageMode, StorageResult, StorageStats, VaultClient,
    VaultError, VaultResult,
};

pub fn config(mode: StorageMode, trigger: ArchivalTrigger) -> StorageConfig {
    let mut config = StorageConfig {
        enabled: true,
        remote_endpoint: "http://vault.test".to_string(),
        api_key: SecretValue::new("test-key"),
        storage_mode: mode,
        ..StorageConfig::default()
    };
    config.archival_policy.trigger = trigger;
    config.anonymization.strategy = AnonymizationStrategy::Redact;
    config.anonymization.pii_types = [PiiType::Email].into_iter().collect();
    config.performance.timeout_seconds = 1;
    config.performance.retry_backoff_ms = 10;
    config.performance.max_backoff_ms = 100;
    config
}

pub fn build(config: StorageConfig, vault: Arc<dyn VaultClient>) -> DualStorageAdapter {
    build_on(config, Arc::new(InMemoryGraphStore::new()), vault)
}

pub fn build_on(
    config: StorageConfig,
    primary: Arc<dyn StorageBackend>,
    vault: Arc<dyn VaultClient>,
) -> DualStorageAdapter {
    DualStorageAdapter::new(config, primary, vault, AdapterStats::new()).unwrap()
}

pub fn message(id: &str, session: &str, text: &str) -> GraphNode {
    GraphNode::new(id, "message", json!(text)).in_session(session)
}

/// Every call fails with a retryable connection error.
#[derive(Debug, Default)]
pub struct UnreachableVault {
    calls: AtomicU64,
}

impl UnreachableVault {
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn fail<T>(&self) -> VaultResult<T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(VaultError::ConnectionError("connection refused".to_string()))
    }
}

#[async_trait]
impl VaultClient for UnreachableVault {
    async fn archive(&self, _entry: &ArchiveEntry) -> VaultResult<String> {
        self.fail()
    }

    async fn batch_archive(&self, _entries: &[ArchiveEntry]) -> VaultResult<Vec<String>> {
        self.fail()
    }

    async fn retrieve(&self, _archive_id: &str) -> VaultResult<ArchiveEntry> {
        self.fail()
    }

    async fn delete(&self, _archive_id: &str) -> VaultResult<()> {
        self.fail()
    }

    async fn apply_retention_policy(&self, _archive_id: &str, _policy_id: &str) -> VaultResult<()> {
        self.fail()
    }

    async fn health_check(&self) -> VaultResult<bool> {
        self.fail()
    }
}

/// Accepts requests and never answers them.
#[derive(Debug, Default)]
pub struct SilentVault;

#[async_trait]
impl VaultClient for SilentVault {
    async fn archive(&self, _entry: &ArchiveEntry) -> VaultResult<String> {
        std::future::pending().await
    }

    async fn batch_archive(&self, _entries: &[ArchiveEntry]) -> VaultResult<Vec<String>> {
        std::future::pending().await
    }

    async fn retrieve(&self, _archive_id: &str) -> VaultResult<ArchiveEntry> {
        std::future::pending().await
    }

    async fn delete(&self, _archive_id: &str) -> VaultResult<()> {
        std::future::pending().await
    }

    async fn apply_retention_policy(&self, _archive_id: &str, _policy_id: &str) -> VaultResult<()> {
        std::future::pending().await
    }

    async fn health_check(&self) -> VaultResult<bool> {
        std::future::pending().await
    }
}

/// In-memory primary that can hold one node write after it has landed, and refuse deletes.
#[derive(Debug, Default)]
pub struct GatedStore {
    inner: InMemoryGraphStore,
    hold_node: Option<String>,
    held: Notify,
    release: Notify,
    fail_deletes: AtomicBool,
}

impl GatedStore {
    /// Writes of node `id` are stored, then wait for `release`.
    pub fn holding(id: &str) -> Self {
        Self {
            hold_node: Some(id.to_string()),
            ..Self::default()
        }
    }

    pub async fn wait_until_held(&self) {
        self.held.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl StorageBackend for GatedStore {
    async fn store_node(&self, node: GraphNode) -> StorageResult<()> {
        let hold = self.hold_node.as_deref() == Some(node.id.as_str());
        self.inner.store_node(node).await?;
        if hold {
            self.held.notify_one();
            self.release.notified().await;
        }
        Ok(())
    }

    async fn store_edge(&self, edge: GraphEdge) -> StorageResult<()> {
        self.inner.store_edge(edge).await
    }

    async fn get_node(&self, id: &str) -> StorageResult<Option<GraphNode>> {
        self.inner.get_node(id).await
    }

    async fn get_edges(&self, node_id: &str, direction: Direction) -> StorageResult<Vec<GraphEdge>> {
        self.inner.get_edges(node_id, direction).await
    }

    async fn get_session_data(&self, session_id: &String) -> StorageResult<Value> {
        self.inner.get_session_data(session_id).await
    }

    async fn delete_session_data(&self, session_id: &String) -> StorageResult<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("primary is read-only".to_string()));
        }
        self.inner.delete_session_data(session_id).await
    }

    async fn stats(&self) -> StorageStats {
        self.inner.stats().await
    }
}
