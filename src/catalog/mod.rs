//! # Metadata & Lineage Catalog
//!
//! In-memory indices over repository metadata and lineage. Both are
//! write-through: every mutation lands in the repository first and the
//! index second, inside the caller's transaction scope, so the cache
//! never holds rows the database rejected. Reads prefer the cache and
//! fall back to the repository, filling the cache on the way out.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::core::{PayloadId, Result};
use crate::repository::{LineageEdgeRecord, MetadataRecord, Repository, RepositoryTx};

/// Shallow-merge `update` into `base`: object keys are merged one level
/// deep, everything else is replaced.
pub fn merge_metadata(base: &serde_json::Value, update: &serde_json::Value) -> serde_json::Value {
    match (base, update) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(update_map)) => {
            let mut merged = base_map.clone();
            for (key, value) in update_map {
                merged.insert(key.clone(), value.clone());
            }
            serde_json::Value::Object(merged)
        }
        _ => update.clone(),
    }
}

/// Write-through cache of current metadata snapshots.
#[derive(Debug, Default)]
pub struct MetadataCache {
    inner: RwLock<HashMap<PayloadId, MetadataRecord>>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, record: MetadataRecord) {
        self.inner.write().insert(record.id, record);
    }

    pub fn get(&self, id: &PayloadId) -> Option<MetadataRecord> {
        self.inner.read().get(id).cloned()
    }

    pub fn remove(&self, id: &PayloadId) {
        self.inner.write().remove(id);
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[derive(Debug, Default)]
struct Adjacency {
    /// Edges arriving at a node (its parents).
    parents: HashMap<PayloadId, Vec<LineageEdgeRecord>>,
    /// Edges leaving a node (its children).
    children: HashMap<PayloadId, Vec<LineageEdgeRecord>>,
}

/// Write-through adjacency cache over the lineage table.
///
/// Traversal tolerates cycles: the walk carries a visited set, so a
/// cyclic graph terminates instead of looping.
#[derive(Debug, Default)]
pub struct LineageIndex {
    inner: RwLock<Adjacency>,
}

impl LineageIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an edge already persisted by the caller.
    pub fn record_edge(&self, edge: &LineageEdgeRecord) {
        let mut inner = self.inner.write();
        inner
            .parents
            .entry(edge.child_id)
            .or_default()
            .push(edge.clone());
        inner
            .children
            .entry(edge.parent_id)
            .or_default()
            .push(edge.clone());
    }

    /// Drop every cached edge touching `id`. Called on payload delete.
    pub fn remove_payload(&self, id: &PayloadId) {
        let mut inner = self.inner.write();
        inner.parents.remove(id);
        inner.children.remove(id);
        for edges in inner.parents.values_mut() {
            edges.retain(|e| e.parent_id != *id);
        }
        for edges in inner.children.values_mut() {
            edges.retain(|e| e.child_id != *id);
        }
    }

    fn cached(&self, id: &PayloadId, upstream: bool) -> Option<Vec<LineageEdgeRecord>> {
        let inner = self.inner.read();
        let map = if upstream { &inner.parents } else { &inner.children };
        map.get(id).cloned()
    }

    fn fill(&self, id: PayloadId, upstream: bool, edges: &[LineageEdgeRecord]) {
        let mut inner = self.inner.write();
        let map = if upstream {
            &mut inner.parents
        } else {
            &mut inner.children
        };
        map.insert(id, edges.to_vec());
    }

    /// Edges for one node in one direction, serving from the cache and
    /// filling it from the transaction on a miss.
    async fn edges_of(
        &self,
        tx: &mut dyn RepositoryTx,
        id: PayloadId,
        upstream: bool,
    ) -> Result<Vec<LineageEdgeRecord>> {
        if let Some(edges) = self.cached(&id, upstream) {
            return Ok(edges);
        }
        let edges = if upstream {
            tx.get_parents(&id).await?
        } else {
            tx.get_children(&id).await?
        };
        self.fill(id, upstream, &edges);
        Ok(edges)
    }

    /// Breadth-first walk from `start`. `upstream` follows parents,
    /// otherwise children. `max_depth == 0` means unbounded; the visited
    /// set guarantees termination either way.
    pub async fn traverse(
        &self,
        repo: &dyn Repository,
        start: PayloadId,
        upstream: bool,
        max_depth: u32,
    ) -> Result<Vec<LineageEdgeRecord>> {
        let mut tx = repo.begin().await?;
        let mut collected = Vec::new();
        let mut visited: HashSet<PayloadId> = HashSet::new();
        let mut frontier: VecDeque<(PayloadId, u32)> = VecDeque::new();

        visited.insert(start);
        frontier.push_back((start, 0));

        while let Some((node, depth)) = frontier.pop_front() {
            if max_depth != 0 && depth >= max_depth {
                continue;
            }
            for edge in self.edges_of(tx.as_mut(), node, upstream).await? {
                let next = if upstream { edge.parent_id } else { edge.child_id };
                collected.push(edge);
                if visited.insert(next) {
                    frontier.push_back((next, depth + 1));
                }
            }
        }

        tx.rollback().await?;
        Ok(collected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::now_ms;
    use crate::repository::MemoryRepository;

    fn edge(parent: PayloadId, child: PayloadId) -> LineageEdgeRecord {
        LineageEdgeRecord {
            parent_id: parent,
            child_id: child,
            operation: "derive".into(),
            role: "input".into(),
            parameters: String::new(),
            created_at_ms: now_ms(),
        }
    }

    #[test]
    fn test_merge_is_shallow() {
        let base = serde_json::json!({"a": 1, "b": {"x": 1}});
        let update = serde_json::json!({"b": {"y": 2}, "c": 3});
        let merged = merge_metadata(&base, &update);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["c"], 3);
        // one level deep: the whole object under "b" is replaced
        assert_eq!(merged["b"], serde_json::json!({"y": 2}));
    }

    #[test]
    fn test_merge_replaces_non_objects() {
        let base = serde_json::json!([1, 2]);
        let update = serde_json::json!({"k": 1});
        assert_eq!(merge_metadata(&base, &update), update);
    }

    #[test]
    fn test_metadata_cache_round_trip() {
        let cache = MetadataCache::new();
        let id = PayloadId::generate();
        cache.put(MetadataRecord {
            id,
            json: serde_json::json!({"k": 1}),
            schema: "v1".into(),
            updated_at_ms: 1,
        });
        assert_eq!(cache.get(&id).unwrap().json["k"], 1);
        cache.remove(&id);
        assert!(cache.get(&id).is_none());
    }

    async fn persist_edges(repo: &MemoryRepository, edges: &[LineageEdgeRecord]) {
        let mut tx = repo.begin().await.unwrap();
        for e in edges {
            tx.insert_lineage(e).await.unwrap();
        }
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_traverse_upstream_chain() {
        let repo = MemoryRepository::new();
        let index = LineageIndex::new();
        let (a, b, c) = (PayloadId::generate(), PayloadId::generate(), PayloadId::generate());
        // a -> b -> c
        persist_edges(&repo, &[edge(a, b), edge(b, c)]).await;

        let edges = index.traverse(&repo, c, true, 0).await.unwrap();
        assert_eq!(edges.len(), 2);

        // depth limit cuts the walk
        let edges = index.traverse(&repo, c, true, 1).await.unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].parent_id, b);
    }

    #[tokio::test]
    async fn test_traverse_downstream() {
        let repo = MemoryRepository::new();
        let index = LineageIndex::new();
        let (a, b, c) = (PayloadId::generate(), PayloadId::generate(), PayloadId::generate());
        // a fans out to b and c
        persist_edges(&repo, &[edge(a, b), edge(a, c)]).await;

        let edges = index.traverse(&repo, a, false, 0).await.unwrap();
        assert_eq!(edges.len(), 2);
    }

    #[tokio::test]
    async fn test_traverse_terminates_on_cycle() {
        let repo = MemoryRepository::new();
        let index = LineageIndex::new();
        let (a, b) = (PayloadId::generate(), PayloadId::generate());
        // a -> b -> a
        persist_edges(&repo, &[edge(a, b), edge(b, a)]).await;

        let edges = index.traverse(&repo, a, false, 0).await.unwrap();
        assert_eq!(edges.len(), 2);
    }

    #[tokio::test]
    async fn test_write_through_serves_without_repo_rows() {
        let repo = MemoryRepository::new();
        let index = LineageIndex::new();
        let (a, b) = (PayloadId::generate(), PayloadId::generate());

        // recorded in the index but intentionally not persisted: the
        // cache must serve it without consulting the repository
        index.record_edge(&edge(a, b));
        let edges = index.traverse(&repo, b, true, 0).await.unwrap();
        assert_eq!(edges.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_payload_evicts_edges() {
        let repo = MemoryRepository::new();
        let index = LineageIndex::new();
        let (a, b) = (PayloadId::generate(), PayloadId::generate());
        index.record_edge(&edge(a, b));

        index.remove_payload(&a);
        // cache cold again; repository has nothing either
        let edges = index.traverse(&repo, b, true, 0).await.unwrap();
        assert!(edges.is_empty());
    }
}
