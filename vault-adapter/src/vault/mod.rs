//! Remote vault (durable tier) contract and implementations.
//!
//! Responsibilities:
//! - `VaultClient` is the façade the adapter talks to; every call carries the API key and is
//!   bounded by the configured timeout.
//! - `HttpVaultClient` speaks JSON over HTTP with reqwest.
//! - `InMemoryVault` keeps archives in process for tests and dry runs.

pub mod http;
pub mod memory;

use crate::error::VaultResult;
use crate::types::{ArchiveEntry, ArchiveId};
use async_trait::async_trait;

pub use http::HttpVaultClient;
pub use memory::InMemoryVault;

#[async_trait]
pub trait VaultClient: Send + Sync {
    async fn archive(&self, entry: &ArchiveEntry) -> VaultResult<ArchiveId>;
    /// Archive several entries in one request. Ids come back in input order.
    async fn batch_archive(&self, entries: &[ArchiveEntry]) -> VaultResult<Vec<ArchiveId>>;
    async fn retrieve(&self, archive_id: &str) -> VaultResult<ArchiveEntry>;
    async fn delete(&self, archive_id: &str) -> VaultResult<()>;
    async fn apply_retention_policy(&self, archive_id: &str, policy_id: &str) -> VaultResult<()>;
    /// `Ok(false)` means the vault answered but reported itself unhealthy.
    async fn health_check(&self) -> VaultResult<bool>;
}
