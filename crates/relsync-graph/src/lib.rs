//! Graph store contracts, Neo4j REST client and the node/edge verifiers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod client;
mod verify;

pub use client::{
    classify_reqwest_error, classify_status, BackoffPolicy, GraphClientConfig, Neo4jRestClient,
    RetryDisposition,
};
pub use verify::{DuplicateResolver, EdgeVerdict, EdgeVerifier, MembershipVerifier};

pub const CRATE_NAME: &str = "relsync-graph";

/// Node entry returned by the external-id index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    #[serde(rename = "self")]
    pub self_url: String,
}

/// Edge entry returned when listing a node's relationships.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeDescriptor {
    pub start: String,
    pub end: String,
    #[serde(rename = "self")]
    pub self_url: String,
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("graph request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding graph response from {url}: {cause}")]
    Decode { url: String, cause: String },
    #[error("{0}")]
    Message(String),
}

/// The subset of the graph store's HTTP surface the reconciler consumes.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Root every self/start/end URL returned by the store is prefixed with.
    fn base_url(&self) -> &str;

    async fn nodes_by_external_id(&self, external_id: &str)
        -> Result<Vec<NodeDescriptor>, GraphError>;

    /// All `rel_type` edges incident to `node_id`, in either direction.
    async fn relationships(
        &self,
        node_id: &str,
        rel_type: &str,
    ) -> Result<Vec<EdgeDescriptor>, GraphError>;

    async fn delete_relationship(&self, rel_id: &str) -> Result<(), GraphError>;
}

/// Internal node id carried by a node URL, e.g. `<base>/db/data/node/42` → `42`.
pub fn node_id_from_url<'u>(base_url: &str, url: &'u str) -> Option<&'u str> {
    id_after(base_url, "/db/data/node/", url)
}

/// Internal edge id carried by a relationship URL.
pub fn relationship_id_from_url<'u>(base_url: &str, url: &'u str) -> Option<&'u str> {
    id_after(base_url, "/db/data/relationship/", url)
}

fn id_after<'u>(base_url: &str, path: &str, url: &'u str) -> Option<&'u str> {
    let id = url
        .strip_prefix(base_url.trim_end_matches('/'))?
        .strip_prefix(path)?;
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}
