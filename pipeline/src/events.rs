//! Payload shapes carried inside [`queue_broker::JobEnvelope::payload`] and
//! [`outbox::OutboxEvent::payload`] for each named queue (spec §6).

use serde::{Deserialize, Serialize};

/// A file batch produced by the discovery batcher's Phase B (§4.3), consumed
/// by the File Analysis Worker (C4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileBatch {
    pub batch_id: String,
    pub files: Vec<BatchedFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchedFile {
    pub file_id: i64,
    pub path: String,
    pub content: String,
    pub content_hash: String,
}

/// Enqueued by C4 once a file has been analyzed, driving C5's aggregation
/// phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryTouched {
    pub directory_path: String,
    pub file_path: String,
}

/// Enqueued by C5's aggregation phase once every file under a directory has
/// reached `analyzed`, driving C5's resolution phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryReady {
    pub directory_path: String,
    pub poi_ids: Vec<String>,
}

/// A cross-directory hint surfaced when a reference can't be resolved
/// locally (intra-file or intra-directory), driving C6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionHint {
    pub from_poi_id: String,
    pub unresolved_name: String,
    pub candidate_poi_ids: Vec<String>,
}

/// A relationship candidate fanned into C7 from C4, C5, or C6, each tagged
/// with the evidence scope that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipCandidate {
    pub from_poi_id: String,
    pub to_poi_id: String,
    pub relationship_type: String,
    pub evidence_source: String,
    pub confidence: f64,
}

/// C7's output, grouped by (from, to, type), driving C8.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationKey {
    pub from_poi_id: String,
    pub to_poi_id: String,
    pub relationship_type: String,
}

/// C8's output: an accepted relationship ready for the graph (C9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptedRelationship {
    pub from_poi_id: String,
    pub to_poi_id: String,
    pub relationship_type: String,
    pub confidence_score: f64,
}
