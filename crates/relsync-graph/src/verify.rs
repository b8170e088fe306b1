//! Node membership and edge checks against the graph store.
//!
//! Every lookup failure resolves toward "missing": an unreachable store or a
//! garbled response must never certify a record as in sync.

use relsync_core::{EdgeMatches, NodeRef, ReconcilePolicy};
use tracing::{debug, info, warn};

use crate::{node_id_from_url, relationship_id_from_url, GraphError, GraphStore};

pub struct MembershipVerifier<'g> {
    graph: &'g dyn GraphStore,
}

impl<'g> MembershipVerifier<'g> {
    pub fn new(graph: &'g dyn GraphStore) -> Self {
        Self { graph }
    }

    /// Internal id of the node indexed under `external_id`, if there is one.
    pub async fn resolve(&self, external_id: &str) -> Option<NodeRef> {
        let nodes = match self.graph.nodes_by_external_id(external_id).await {
            Ok(nodes) => nodes,
            Err(err) => {
                warn!(external_id, error = %err, "node lookup failed");
                return None;
            }
        };

        let node = nodes.first()?;
        let internal_id = node_id_from_url(self.graph.base_url(), &node.self_url)?;
        Some(NodeRef {
            external_id: external_id.to_string(),
            internal_id: internal_id.to_string(),
        })
    }
}

/// Deletes surplus edges one batch at a time; a failed delete does not stop the rest.
pub struct DuplicateResolver<'g> {
    graph: &'g dyn GraphStore,
}

impl<'g> DuplicateResolver<'g> {
    pub fn new(graph: &'g dyn GraphStore) -> Self {
        Self { graph }
    }

    /// Returns how many of `edge_ids` were actually deleted.
    pub async fn delete_all(&self, edge_ids: &[String]) -> usize {
        let mut deleted = 0;
        for id in edge_ids {
            match self.graph.delete_relationship(id).await {
                Ok(()) => deleted += 1,
                Err(err) => warn!(rel_id = %id, error = %err, "err deleting rel"),
            }
        }
        deleted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeVerdict {
    /// No edge of the type joins the two nodes, or the lookup failed.
    Missing,
    Single,
    /// More than one edge; `deleted` is zero unless the type is in the dedup set.
    Duplicated { found: usize, deleted: usize },
}

impl EdgeVerdict {
    pub fn exists(&self) -> bool {
        !matches!(self, Self::Missing)
    }
}

pub struct EdgeVerifier<'g> {
    graph: &'g dyn GraphStore,
    policy: &'g ReconcilePolicy,
    resolver: DuplicateResolver<'g>,
}

impl<'g> EdgeVerifier<'g> {
    pub fn new(graph: &'g dyn GraphStore, policy: &'g ReconcilePolicy) -> Self {
        Self {
            graph,
            policy,
            resolver: DuplicateResolver::new(graph),
        }
    }

    /// Edges of `rel_type` incident to `from_id` whose far endpoint is `to_id`.
    ///
    /// The far endpoint is the edge's `end`, or its `start` when `flipped`.
    pub async fn matches(
        &self,
        from_id: &str,
        to_id: &str,
        rel_type: &str,
        flipped: bool,
    ) -> Result<EdgeMatches, GraphError> {
        let base = self.graph.base_url();
        let edges = self.graph.relationships(from_id, rel_type).await?;

        let mut matches = EdgeMatches::default();
        for edge in &edges {
            let endpoint = if flipped { &edge.start } else { &edge.end };
            if node_id_from_url(base, endpoint) != Some(to_id) {
                continue;
            }
            match relationship_id_from_url(base, &edge.self_url) {
                Some(id) => matches.edge_ids.push(id.to_string()),
                None => debug!(url = %edge.self_url, "skipping edge without a relationship id"),
            }
        }
        Ok(matches)
    }

    pub async fn verify(
        &self,
        from_id: &str,
        to_id: &str,
        rel_type: &str,
        flipped: bool,
    ) -> EdgeVerdict {
        let matches = match self.matches(from_id, to_id, rel_type, flipped).await {
            Ok(matches) => matches,
            Err(err) => {
                warn!(from_id, to_id, rel_type, error = %err, "relationship lookup failed");
                return EdgeVerdict::Missing;
            }
        };

        match matches.count() {
            0 => EdgeVerdict::Missing,
            1 => EdgeVerdict::Single,
            found => {
                info!(rel_type, rel_ids = ?matches.edge_ids, "multiple rels found");
                // Other types keep their duplicates; see DESIGN.md.
                let deleted = if self.policy.prunes_duplicates(rel_type) {
                    let deleted = self.resolver.delete_all(matches.duplicates()).await;
                    info!(rel_type, deleted, "deleted duplicate rels");
                    deleted
                } else {
                    0
                };
                EdgeVerdict::Duplicated { found, deleted }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EdgeDescriptor, NodeDescriptor};
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    const BASE: &str = "http://graph.local:7474";

    fn node_url(id: &str) -> String {
        format!("{BASE}/db/data/node/{id}")
    }

    fn edge(id: &str, start: &str, end: &str) -> EdgeDescriptor {
        EdgeDescriptor {
            start: node_url(start),
            end: node_url(end),
            self_url: format!("{BASE}/db/data/relationship/{id}"),
        }
    }

    #[derive(Default)]
    struct MemoryGraph {
        nodes: HashMap<String, Vec<NodeDescriptor>>,
        edges: HashMap<(String, String), Vec<EdgeDescriptor>>,
        failing_lookups: HashSet<String>,
        failing_deletes: HashSet<String>,
        deleted: Mutex<Vec<String>>,
        edge_queries: Mutex<Vec<(String, String)>>,
    }

    impl MemoryGraph {
        fn with_node(mut self, external_id: &str, internal_id: &str) -> Self {
            self.nodes.insert(
                external_id.into(),
                vec![NodeDescriptor {
                    self_url: node_url(internal_id),
                }],
            );
            self
        }

        fn with_edges(mut self, node: &str, rel_type: &str, edges: Vec<EdgeDescriptor>) -> Self {
            self.edges.insert((node.into(), rel_type.into()), edges);
            self
        }

        fn deleted(&self) -> Vec<String> {
            self.deleted.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl GraphStore for MemoryGraph {
        fn base_url(&self) -> &str {
            BASE
        }

        async fn nodes_by_external_id(
            &self,
            external_id: &str,
        ) -> Result<Vec<NodeDescriptor>, GraphError> {
            if self.failing_lookups.contains(external_id) {
                return Err(GraphError::Message("connection refused".into()));
            }
            Ok(self.nodes.get(external_id).cloned().unwrap_or_default())
        }

        async fn relationships(
            &self,
            node_id: &str,
            rel_type: &str,
        ) -> Result<Vec<EdgeDescriptor>, GraphError> {
            self.edge_queries
                .lock()
                .unwrap()
                .push((node_id.into(), rel_type.into()));
            if self.failing_lookups.contains(node_id) {
                return Err(GraphError::Decode {
                    url: node_url(node_id),
                    cause: "expected value at line 1 column 1".into(),
                });
            }
            Ok(self
                .edges
                .get(&(node_id.to_string(), rel_type.to_string()))
                .cloned()
                .unwrap_or_default())
        }

        async fn delete_relationship(&self, rel_id: &str) -> Result<(), GraphError> {
            if self.failing_deletes.contains(rel_id) {
                return Err(GraphError::HttpStatus {
                    status: 500,
                    url: format!("{BASE}/db/data/batch"),
                });
            }
            self.deleted.lock().unwrap().push(rel_id.into());
            Ok(())
        }
    }

    #[tokio::test]
    async fn membership_resolves_internal_id() {
        let graph = MemoryGraph::default().with_node("acc1", "17");
        let verifier = MembershipVerifier::new(&graph);

        let node = verifier.resolve("acc1").await.unwrap();
        assert_eq!(node.internal_id, "17");
        assert_eq!(node.external_id, "acc1");
    }

    #[tokio::test]
    async fn membership_treats_empty_error_and_bad_urls_as_missing() {
        let mut graph = MemoryGraph::default();
        graph.failing_lookups.insert("acc2".into());
        graph.nodes.insert(
            "acc3".into(),
            vec![NodeDescriptor {
                self_url: "http://elsewhere/db/data/node/5".into(),
            }],
        );
        let verifier = MembershipVerifier::new(&graph);

        assert!(verifier.resolve("acc1").await.is_none());
        assert!(verifier.resolve("acc2").await.is_none());
        assert!(verifier.resolve("acc3").await.is_none());
    }

    #[tokio::test]
    async fn counts_only_edges_ending_at_the_target() {
        let graph = MemoryGraph::default().with_edges(
            "17",
            "member",
            vec![edge("900", "17", "40"), edge("901", "17", "41")],
        );
        let policy = ReconcilePolicy::default();
        let verifier = EdgeVerifier::new(&graph, &policy);

        assert_eq!(verifier.verify("17", "40", "member", false).await, EdgeVerdict::Single);
        assert_eq!(verifier.verify("17", "99", "member", false).await, EdgeVerdict::Missing);
    }

    #[tokio::test]
    async fn flipped_check_compares_the_start_endpoint() {
        // Edge runs 17 -> 40 and is listed from node 40.
        let graph = MemoryGraph::default().with_edges("40", "member", vec![edge("900", "17", "40")]);
        let policy = ReconcilePolicy::default();
        let verifier = EdgeVerifier::new(&graph, &policy);

        assert_eq!(verifier.verify("40", "17", "member", true).await, EdgeVerdict::Single);
        assert_eq!(verifier.verify("40", "17", "member", false).await, EdgeVerdict::Missing);
    }

    #[tokio::test]
    async fn duplicate_dedup_type_edges_are_pruned_to_one() {
        let graph = MemoryGraph::default().with_edges(
            "17",
            "member",
            vec![
                edge("900", "17", "40"),
                edge("901", "17", "40"),
                edge("902", "17", "40"),
            ],
        );
        let policy = ReconcilePolicy::default();
        let verifier = EdgeVerifier::new(&graph, &policy);

        let verdict = verifier.verify("17", "40", "member", false).await;

        assert_eq!(verdict, EdgeVerdict::Duplicated { found: 3, deleted: 2 });
        assert!(verdict.exists());
        assert_eq!(graph.deleted(), vec!["901".to_string(), "902".to_string()]);
    }

    #[tokio::test]
    async fn duplicates_of_other_types_are_left_alone() {
        let graph = MemoryGraph::default().with_edges(
            "17",
            "follower",
            vec![edge("900", "17", "40"), edge("901", "17", "40")],
        );
        let policy = ReconcilePolicy::default();
        let verifier = EdgeVerifier::new(&graph, &policy);

        let verdict = verifier.verify("17", "40", "follower", false).await;

        assert_eq!(verdict, EdgeVerdict::Duplicated { found: 2, deleted: 0 });
        assert!(verdict.exists());
        assert!(graph.deleted().is_empty());
    }

    #[tokio::test]
    async fn failed_delete_does_not_stop_the_rest() {
        let mut graph = MemoryGraph::default();
        graph.failing_deletes.insert("901".into());
        let resolver = DuplicateResolver::new(&graph);

        let deleted = resolver
            .delete_all(&["901".to_string(), "902".to_string(), "903".to_string()])
            .await;

        assert_eq!(deleted, 2);
        assert_eq!(graph.deleted(), vec!["902".to_string(), "903".to_string()]);
    }

    #[tokio::test]
    async fn lookup_failure_is_missing() {
        let mut graph = MemoryGraph::default();
        graph.failing_lookups.insert("17".into());
        let policy = ReconcilePolicy::default();
        let verifier = EdgeVerifier::new(&graph, &policy);

        assert_eq!(verifier.verify("17", "40", "member", false).await, EdgeVerdict::Missing);
        assert_eq!(
            graph.edge_queries.lock().unwrap().clone(),
            vec![("17".to_string(), "member".to_string())]
        );
    }

    #[tokio::test]
    async fn edges_with_unparsable_self_urls_do_not_count() {
        let mut bad = edge("900", "17", "40");
        bad.self_url = "http://elsewhere/db/data/relationship/900".into();
        let graph = MemoryGraph::default().with_edges("17", "member", vec![bad]);
        let policy = ReconcilePolicy::default();
        let verifier = EdgeVerifier::new(&graph, &policy);

        let matches = verifier.matches("17", "40", "member", false).await.unwrap();
        assert_eq!(matches.count(), 0);
    }
}
