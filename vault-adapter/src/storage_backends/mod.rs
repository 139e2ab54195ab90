//! Primary (hot) tier storage contract.
//!
//! `StorageBackend` is what the embedded graph store implements and what
//! `DualStorageAdapter` implements outward, so the adapter can stand in wherever a
//! backend was used directly.

pub mod memory;

use crate::error::StorageResult;
use crate::types::{Direction, GraphEdge, GraphNode, SessionId, StorageStats};
use async_trait::async_trait;
use serde_json::Value;

pub use memory::InMemoryGraphStore;

/// Primary storage contract. Implementations must be safe for concurrent callers.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn store_node(&self, node: GraphNode) -> StorageResult<()>;
    async fn store_edge(&self, edge: GraphEdge) -> StorageResult<()>;
    async fn get_node(&self, id: &str) -> StorageResult<Option<GraphNode>>;
    async fn get_edges(&self, node_id: &str, direction: Direction) -> StorageResult<Vec<GraphEdge>>;
    /// Everything stored for a session as one structured value:
    /// `{"session_id": .., "nodes": [..], "edges": [..]}`.
    async fn get_session_data(&self, session_id: &SessionId) -> StorageResult<Value>;
    async fn delete_session_data(&self, session_id: &SessionId) -> StorageResult<()>;
    async fn stats(&self) -> StorageStats;
}
