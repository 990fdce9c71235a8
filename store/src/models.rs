use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a discovered source file (spec §3 invariant 5: advances
/// monotonically discovered -> analyzing -> {analyzed, failed}).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Discovered,
    Analyzing,
    Analyzed,
    Failed,
}

impl FileStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FileStatus::Discovered => "discovered",
            FileStatus::Analyzing => "analyzing",
            FileStatus::Analyzed => "analyzed",
            FileStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "discovered" => Some(FileStatus::Discovered),
            "analyzing" => Some(FileStatus::Analyzing),
            "analyzed" => Some(FileStatus::Analyzed),
            "failed" => Some(FileStatus::Failed),
            _ => None,
        }
    }

    /// Whether `self -> next` is a legal transition under invariant 5.
    pub fn can_advance_to(self, next: FileStatus) -> bool {
        matches!(
            (self, next),
            (FileStatus::Discovered, FileStatus::Analyzing)
                | (FileStatus::Analyzing, FileStatus::Analyzed)
                | (FileStatus::Analyzing, FileStatus::Failed)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: i64,
    pub path: String,
    pub content_hash: String,
    pub last_modified: DateTime<Utc>,
    pub status: FileStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Kind of Point-of-Interest (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoiKind {
    Function,
    Class,
    Variable,
    File,
    Directory,
}

impl PoiKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PoiKind::Function => "function",
            PoiKind::Class => "class",
            PoiKind::Variable => "variable",
            PoiKind::File => "file",
            PoiKind::Directory => "directory",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "function" => Some(PoiKind::Function),
            "class" => Some(PoiKind::Class),
            "variable" => Some(PoiKind::Variable),
            "file" => Some(PoiKind::File),
            "directory" => Some(PoiKind::Directory),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoiRecord {
    pub id: i64,
    pub poi_id: String,
    pub file_id: i64,
    pub kind: PoiKind,
    pub name: String,
    pub file_path: String,
    pub start_line: i64,
    pub end_line: i64,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A candidate relationship not yet written to the store (the caller
/// supplies `poi_id`/coordinates; the store assigns `id`/`created_at`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPoi {
    pub poi_id: String,
    pub file_id: i64,
    pub kind: PoiKind,
    pub name: String,
    pub file_path: String,
    pub start_line: i64,
    pub end_line: i64,
    pub metadata: serde_json::Value,
}

/// Relationship kind between two POIs (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    Calls,
    Imports,
    Contains,
    References,
}

impl RelationshipType {
    pub fn as_str(self) -> &'static str {
        match self {
            RelationshipType::Calls => "calls",
            RelationshipType::Imports => "imports",
            RelationshipType::Contains => "contains",
            RelationshipType::References => "references",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "calls" => Some(RelationshipType::Calls),
            "imports" => Some(RelationshipType::Imports),
            "contains" => Some(RelationshipType::Contains),
            "references" => Some(RelationshipType::References),
            _ => None,
        }
    }
}

/// Scope an item of Candidate Evidence was observed in (spec §4.8 noisy-OR
/// combiner weights: deterministic=1.0, intra_file=0.7, intra_directory=0.5,
/// global=0.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceSource {
    Deterministic,
    IntraFile,
    IntraDirectory,
    Global,
}

impl EvidenceSource {
    pub fn as_str(self) -> &'static str {
        match self {
            EvidenceSource::Deterministic => "deterministic",
            EvidenceSource::IntraFile => "intra_file",
            EvidenceSource::IntraDirectory => "intra_directory",
            EvidenceSource::Global => "global",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "deterministic" => Some(EvidenceSource::Deterministic),
            "intra_file" => Some(EvidenceSource::IntraFile),
            "intra_directory" => Some(EvidenceSource::IntraDirectory),
            "global" => Some(EvidenceSource::Global),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub id: i64,
    pub from_poi_id: String,
    pub to_poi_id: String,
    pub relationship_type: RelationshipType,
    pub evidence_source: EvidenceSource,
    pub confidence: f64,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvidence {
    pub from_poi_id: String,
    pub to_poi_id: String,
    pub relationship_type: RelationshipType,
    pub evidence_source: EvidenceSource,
    pub confidence: f64,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipRecord {
    pub id: i64,
    pub from_poi_id: String,
    pub to_poi_id: String,
    pub relationship_type: RelationshipType,
    pub confidence_score: f64,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectorySummaryRecord {
    pub id: i64,
    pub directory_path: String,
    pub summary: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle of a pipeline run (spec §10.5 `PipelineRegistry`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineRunStatus {
    Running,
    Completed,
    CompletedWithFailures,
    Failed,
}

impl PipelineRunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineRunStatus::Running => "running",
            PipelineRunStatus::Completed => "completed",
            PipelineRunStatus::CompletedWithFailures => "completed_with_failures",
            PipelineRunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(PipelineRunStatus::Running),
            "completed" => Some(PipelineRunStatus::Completed),
            "completed_with_failures" => Some(PipelineRunStatus::CompletedWithFailures),
            "failed" => Some(PipelineRunStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRunRecord {
    pub id: i64,
    pub pipeline_id: String,
    pub target_directory: String,
    pub status: PipelineRunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub phase_counters: serde_json::Value,
    pub last_error: Option<String>,
}
