use super::StorageBackend;
use crate::error::{StorageError, StorageResult};
use crate::types::{
    Direction, GraphEdge, GraphNode, NodeId, SessionId, StorageStats, UNSCOPED_SESSION,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Default)]
struct GraphTables {
    nodes: HashMap<NodeId, GraphNode>,
    edges: HashMap<String, GraphEdge>,
}

/// In-memory primary tier, used by tests and as the default embedded store.
#[derive(Debug, Default)]
pub struct InMemoryGraphStore {
    tables: RwLock<GraphTables>,
}

fn session_of(session_id: &Option<SessionId>) -> &str {
    session_id.as_deref().unwrap_or(UNSCOPED_SESSION)
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    // The tables stay structurally valid even if a writer panicked mid-call.
    fn read(&self) -> RwLockReadGuard<'_, GraphTables> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, GraphTables> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl StorageBackend for InMemoryGraphStore {
    async fn store_node(&self, node: GraphNode) -> StorageResult<()> {
        if node.id.is_empty() {
            return Err(StorageError::Backend("node id must not be empty".to_string()));
        }
        self.write().nodes.insert(node.id.clone(), node);
        Ok(())
    }

    async fn store_edge(&self, edge: GraphEdge) -> StorageResult<()> {
        let mut tables = self.write();
        for endpoint in [&edge.from_node, &edge.to_node] {
            if !tables.nodes.contains_key(endpoint) {
                return Err(StorageError::NotFound(format!("node {}", endpoint)));
            }
        }
        tables.edges.insert(edge.id.clone(), edge);
        Ok(())
    }

    async fn get_node(&self, id: &str) -> StorageResult<Option<GraphNode>> {
        Ok(self.read().nodes.get(id).cloned())
    }

    async fn get_edges(&self, node_id: &str, direction: Direction) -> StorageResult<Vec<GraphEdge>> {
        let tables = self.read();
        let mut edges: Vec<GraphEdge> = tables
            .edges
            .values()
            .filter(|e| match direction {
                Direction::Outgoing => e.from_node == node_id,
                Direction::Incoming => e.to_node == node_id,
                Direction::Both => e.from_node == node_id || e.to_node == node_id,
            })
            .cloned()
            .collect();
        edges.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(edges)
    }

    async fn get_session_data(&self, session_id: &SessionId) -> StorageResult<Value> {
        let tables = self.read();
        let mut nodes: Vec<&GraphNode> = tables
            .nodes
            .values()
            .filter(|n| session_of(&n.session_id) == session_id)
            .collect();
        let mut edges: Vec<&GraphEdge> = tables
            .edges
            .values()
            .filter(|e| session_of(&e.session_id) == session_id)
            .collect();
        if nodes.is_empty() && edges.is_empty() {
            return Err(StorageError::NotFound(format!("session {}", session_id)));
        }
        nodes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        edges.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(json!({
            "session_id": session_id,
            "nodes": serde_json::to_value(nodes)?,
            "edges": serde_json::to_value(edges)?,
        }))
    }

    async fn delete_session_data(&self, session_id: &SessionId) -> StorageResult<()> {
        let mut tables = self.write();
        let removed: HashSet<NodeId> = tables
            .nodes
            .values()
            .filter(|n| session_of(&n.session_id) == session_id)
            .map(|n| n.id.clone())
            .collect();
        tables.nodes.retain(|id, _| !removed.contains(id));
        // Edges hanging off removed nodes go too, whatever session they were written in.
        tables.edges.retain(|_, e| {
            session_of(&e.session_id) != session_id
                && !removed.contains(&e.from_node)
                && !removed.contains(&e.to_node)
        });
        Ok(())
    }

    async fn stats(&self) -> StorageStats {
        let tables = self.read();
        let sessions: HashSet<&str> = tables
            .nodes
            .values()
            .map(|n| session_of(&n.session_id))
            .chain(tables.edges.values().map(|e| session_of(&e.session_id)))
            .collect();
        StorageStats {
            node_count: tables.nodes.len(),
            edge_count: tables.edges.len(),
            session_count: sessions.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn seeded() -> InMemoryGraphStore {
        let store = InMemoryGraphStore::new();
        store
            .store_node(GraphNode::new("a", "message", json!({"text": "hi"})).in_session("s1"))
            .await
            .unwrap();
        store
            .store_node(GraphNode::new("b", "message", json!({"text": "yo"})).in_session("s1"))
            .await
            .unwrap();
        store
            .store_node(GraphNode::new("c", "message", json!({"text": "other"})).in_session("s2"))
            .await
            .unwrap();
        store
            .store_edge(GraphEdge::new("e1", "a", "b", "reply").in_session("s1"))
            .await
            .unwrap();
        store
            .store_edge(GraphEdge::new("e2", "c", "a", "refers").in_session("s2"))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_edges_by_direction() {
        let store = seeded().await;
        let out = store.get_edges("a", Direction::Outgoing).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, "e1");
        let incoming = store.get_edges("a", Direction::Incoming).await.unwrap();
        assert_eq!(incoming[0].id, "e2");
        assert_eq!(store.get_edges("a", Direction::Both).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_edge_requires_existing_endpoints() {
        let store = seeded().await;
        let err = store
            .store_edge(GraphEdge::new("e3", "a", "missing", "reply"))
            .await
            .unwrap_err();
        assert_eq!(err, StorageError::NotFound("node missing".to_string()));
    }

    #[tokio::test]
    async fn test_session_data_shape() {
        let store = seeded().await;
        let data = store.get_session_data(&"s1".to_string()).await.unwrap();
        assert_eq!(data["session_id"], "s1");
        assert_eq!(data["nodes"].as_array().unwrap().len(), 2);
        assert_eq!(data["edges"].as_array().unwrap().len(), 1);
        assert!(matches!(
            store.get_session_data(&"nope".to_string()).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_session_removes_dangling_edges() {
        let store = seeded().await;
        store.delete_session_data(&"s1".to_string()).await.unwrap();
        assert!(store.get_node("a").await.unwrap().is_none());
        assert!(store.get_node("c").await.unwrap().is_some());
        let stats = store.stats().await;
        assert_eq!(stats.node_count, 1);
        assert_eq!(stats.edge_count, 0);
        assert_eq!(stats.session_count, 1);
    }

    #[tokio::test]
    async fn test_unscoped_nodes_share_a_session() {
        let store = InMemoryGraphStore::new();
        store
            .store_node(GraphNode::new("x", "note", json!("free")))
            .await
            .unwrap();
        let data = store
            .get_session_data(&UNSCOPED_SESSION.to_string())
            .await
            .unwrap();
        assert_eq!(data["nodes"][0]["id"], "x");
    }
}
