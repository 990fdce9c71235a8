//! Queue name constants (spec §6: "names are contract").
//!
//! `graph-builder-queue` is not in the §6 queue name list verbatim, but §4.9
//! refers to it by name ("emit outbox event to graph-builder queue"); it is
//! named here consistently with the other `*-queue` contract names.
//! `files-to-batch` is the Phase A -> Phase B internal queue from §4.3 and is
//! deliberately not part of the downstream analysis pipeline's named
//! contract queues.

pub const FILES_TO_BATCH: &str = "files-to-batch";
pub const FILE_ANALYSIS: &str = "file-analysis-queue";
pub const DIRECTORY_AGGREGATION: &str = "directory-aggregation-queue";
pub const DIRECTORY_RESOLUTION: &str = "directory-resolution-queue";
pub const RELATIONSHIP_RESOLUTION: &str = "relationship-resolution-queue";
pub const GLOBAL_RESOLUTION: &str = "global-resolution-queue";
pub const RELATIONSHIP_VALIDATED: &str = "relationship-validated-queue";
pub const RECONCILIATION: &str = "reconciliation-queue";
pub const ANALYSIS_FINDINGS: &str = "analysis-findings-queue";
pub const GRAPH_BUILDER: &str = "graph-builder-queue";
