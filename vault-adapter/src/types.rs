//! Value types shared by the primary store, the vault client and the adapter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

pub type NodeId = String;
pub type SessionId = String;
pub type ArchiveId = String;

/// Session id used for graph elements written without one.
pub const UNSCOPED_SESSION: &str = "unscoped";

/// A node of the conversation/session graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphNode {
    pub id: NodeId,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub session_id: Option<SessionId>,
    pub node_type: String,
    pub content: Value,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl GraphNode {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>, content: Value) -> Self {
        Self {
            id: id.into(),
            session_id: None,
            node_type: node_type.into(),
            content,
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn in_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// A directed edge between two graph nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphEdge {
    pub id: String,
    pub from_node: NodeId,
    pub to_node: NodeId,
    pub edge_type: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub properties: Value,
    pub created_at: DateTime<Utc>,
}

impl GraphEdge {
    pub fn new(
        id: impl Into<String>,
        from_node: impl Into<String>,
        to_node: impl Into<String>,
        edge_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            from_node: from_node.into(),
            to_node: to_node.into(),
            edge_type: edge_type.into(),
            session_id: None,
            properties: Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn in_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Which edges of a node to return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outgoing,
    Incoming,
    Both,
}

/// Size counters reported by the primary store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStats {
    pub node_count: usize,
    pub edge_count: usize,
    pub session_count: usize,
}

/// What an archive entry carries: a whole session, or a single mirrored write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveKind {
    Session,
    NodeMirror,
    EdgeMirror,
}

/// Unit of data submitted to the remote vault. The payload has already been anonymized
/// by the time an entry leaves the adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArchiveEntry {
    pub session_id: SessionId,
    pub kind: ArchiveKind,
    pub payload: Value,
    pub retention_days: u32,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// When the payload was read from the primary tier.
    pub captured_at: DateTime<Utc>,
}

impl ArchiveEntry {
    /// Serialized payload size, used for the `bytes_archived` statistic.
    pub fn payload_size(&self) -> u64 {
        serde_json::to_vec(&self.payload)
            .map(|v| v.len() as u64)
            .unwrap_or(0)
    }
}
