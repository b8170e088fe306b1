//! Core data model, repair envelope and reconcile policy for relsync.

use std::fmt;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "relsync-core";

/// Event name carried by every repair envelope.
pub const REPAIR_EVENT_NAME: &str = "RelationshipSaved";

/// Group every guest account is attached to; its memberships are never reconciled.
pub const GUEST_GROUP_ID: &str = "51f41f195f07655e560001c1";

/// Relationship types whose duplicate edges are pruned in place.
pub const DEDUP_RELATIONSHIP_TYPES: [&str; 3] = ["member", "creator", "author"];

/// Source kind whose edges are enumerated from the target side.
pub const FLIPPED_SOURCE_KIND: &str = "JGroup";

/// Entity kinds that never get mirrored into the graph store.
pub const DEFAULT_EXCLUDED_KINDS: [&str; 18] = [
    "CStatusActivity",
    "CFolloweeBucketActivity",
    "CFollowerBucketActivity",
    "CCodeSnipActivity",
    "CDiscussionActivity",
    "CReplieeBucketActivity",
    "CReplierBucketActivity",
    "CBlogPostActivity",
    "CNewMemberBucketActivity",
    "CTutorialActivity",
    "CLikeeBucketActivity",
    "CLikerBucketActivity",
    "CInstalleeBucketActivity",
    "CInstallerBucketActivity",
    "CActivity",
    "CRunnableActivity",
    "JAppStorage",
    "JFeed",
];

/// A relationship row read from the primary store.
///
/// The serde names match the projection carried inside a repair event, so a
/// record serializes directly into the payload downstream consumers expect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipRecord {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "sourceId")]
    pub source_id: String,
    #[serde(rename = "sourceName")]
    pub source_name: String,
    #[serde(rename = "targetId")]
    pub target_id: String,
    #[serde(rename = "targetName")]
    pub target_name: String,
    #[serde(rename = "as")]
    pub rel_type: String,
}

impl RelationshipRecord {
    /// Whether edges for this record are looked up from the target's side.
    pub fn is_flipped(&self) -> bool {
        self.source_name == FLIPPED_SOURCE_KIND
    }
}

/// External id paired with the internal id the graph store assigned to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRef {
    pub external_id: String,
    pub internal_id: String,
}

/// Edges of one type found between two internal node ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EdgeMatches {
    pub edge_ids: Vec<String>,
}

impl EdgeMatches {
    pub fn count(&self) -> usize {
        self.edge_ids.len()
    }

    /// Every match after the first one.
    pub fn duplicates(&self) -> &[String] {
        self.edge_ids.get(1..).unwrap_or_default()
    }
}

/// Envelope published to the graph feeder exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairEvent {
    pub event: String,
    pub payload: Vec<RelationshipRecord>,
}

impl RepairEvent {
    pub fn for_record(record: &RelationshipRecord) -> Self {
        Self {
            event: REPAIR_EVENT_NAME.to_string(),
            payload: vec![record.clone()],
        }
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Why a record was judged out of sync with the graph store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum InconsistencyReason {
    MissingSource,
    MissingTarget,
    MissingRelationship,
}

impl fmt::Display for InconsistencyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::MissingSource => "No source node",
            Self::MissingTarget => "No target node",
            Self::MissingRelationship => "No relationship",
        };
        f.write_str(text)
    }
}

/// Fixed lists that decide which records are skipped and which duplicates get pruned.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReconcilePolicy {
    #[serde(default = "default_excluded_group_id")]
    pub excluded_group_id: String,
    #[serde(default = "default_dedup_relationship_types")]
    pub dedup_relationship_types: Vec<String>,
    #[serde(default = "default_excluded_kinds")]
    pub excluded_kinds: Vec<String>,
}

fn default_excluded_group_id() -> String {
    GUEST_GROUP_ID.to_string()
}

fn default_dedup_relationship_types() -> Vec<String> {
    DEDUP_RELATIONSHIP_TYPES.iter().map(|s| s.to_string()).collect()
}

fn default_excluded_kinds() -> Vec<String> {
    DEFAULT_EXCLUDED_KINDS.iter().map(|s| s.to_string()).collect()
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            excluded_group_id: default_excluded_group_id(),
            dedup_relationship_types: default_dedup_relationship_types(),
            excluded_kinds: default_excluded_kinds(),
        }
    }
}

impl ReconcilePolicy {
    pub const FILE_NAME: &'static str = "policy.yaml";

    /// Load `policy.yaml` from the workspace root, falling back to the built-in lists.
    pub fn from_workspace_root(root: &Path) -> anyhow::Result<Self> {
        let path = root.join(Self::FILE_NAME);
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Records touching the excluded group are neither checked nor republished.
    pub fn is_excluded(&self, record: &RelationshipRecord) -> bool {
        record.source_id == self.excluded_group_id || record.target_id == self.excluded_group_id
    }

    pub fn prunes_duplicates(&self, rel_type: &str) -> bool {
        self.dedup_relationship_types.iter().any(|t| t == rel_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(source_id: &str, target_id: &str) -> RelationshipRecord {
        RelationshipRecord {
            id: "5200a1b2c3d4e5f600000001".into(),
            source_id: source_id.into(),
            source_name: "JAccount".into(),
            target_id: target_id.into(),
            target_name: "JGroup".into(),
            rel_type: "member".into(),
        }
    }

    #[test]
    fn repair_event_uses_projection_field_names() {
        let event = RepairEvent::for_record(&record("a1", "b2"));
        let value: serde_json::Value = serde_json::from_slice(&event.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "event": "RelationshipSaved",
                "payload": [{
                    "_id": "5200a1b2c3d4e5f600000001",
                    "sourceId": "a1",
                    "sourceName": "JAccount",
                    "targetId": "b2",
                    "targetName": "JGroup",
                    "as": "member"
                }]
            })
        );
    }

    #[test]
    fn guest_group_is_excluded_on_either_side() {
        let policy = ReconcilePolicy::default();
        assert!(policy.is_excluded(&record(GUEST_GROUP_ID, "b2")));
        assert!(policy.is_excluded(&record("a1", GUEST_GROUP_ID)));
        assert!(!policy.is_excluded(&record("a1", "b2")));
    }

    #[test]
    fn dedup_set_matches_exact_type_names() {
        let policy = ReconcilePolicy::default();
        assert!(policy.prunes_duplicates("member"));
        assert!(policy.prunes_duplicates("creator"));
        assert!(policy.prunes_duplicates("author"));
        assert!(!policy.prunes_duplicates("follower"));
        assert!(!policy.prunes_duplicates("Member"));
    }

    #[test]
    fn duplicates_skip_the_first_match() {
        let matches = EdgeMatches {
            edge_ids: vec!["10".into(), "11".into(), "12".into()],
        };
        assert_eq!(matches.count(), 3);
        assert_eq!(matches.duplicates(), ["11".to_string(), "12".to_string()]);
        assert!(EdgeMatches::default().duplicates().is_empty());
    }

    #[test]
    fn only_group_sources_are_flipped() {
        let mut rec = record("a1", "b2");
        assert!(!rec.is_flipped());
        rec.source_name = "JGroup".into();
        assert!(rec.is_flipped());
    }

    #[test]
    fn policy_file_overrides_defaults_per_field() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join(ReconcilePolicy::FILE_NAME),
            "dedup_relationship_types: [member]\n",
        )
        .expect("write policy");

        let policy = ReconcilePolicy::from_workspace_root(dir.path()).expect("policy");
        assert_eq!(policy.dedup_relationship_types, vec!["member".to_string()]);
        assert_eq!(policy.excluded_group_id, GUEST_GROUP_ID);
        assert_eq!(policy.excluded_kinds.len(), DEFAULT_EXCLUDED_KINDS.len());
    }

    #[test]
    fn missing_policy_file_yields_defaults() {
        let dir = tempdir().expect("tempdir");
        let policy = ReconcilePolicy::from_workspace_root(dir.path()).expect("policy");
        assert_eq!(policy, ReconcilePolicy::default());
    }

    #[test]
    fn reasons_render_log_text() {
        assert_eq!(InconsistencyReason::MissingSource.to_string(), "No source node");
        assert_eq!(InconsistencyReason::MissingTarget.to_string(), "No target node");
        assert_eq!(InconsistencyReason::MissingRelationship.to_string(), "No relationship");
    }
}
