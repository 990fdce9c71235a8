//! File Analysis Worker (C4, spec §4.4).
//!
//! Runs a deterministic lexical pre-pass (import/require statement
//! extraction against raw file content, `evidence_source='deterministic'`)
//! independent of and before the oracle call, then an oracle call
//! (`evidence_source='intra_file'`), writes the resulting POIs and evidence,
//! advances each file to `analyzed`, and fans candidate relationships out to
//! validation plus a `directory-aggregation` touch event per file. All
//! outbox events for one batch are written in the same transaction as the
//! file-status advance.

use std::collections::HashMap;

use async_trait::async_trait;
use idempotent_consumer::ProcessingResult;
use once_cell::sync::Lazy;
use outbox::{OutboxEvent, OutboxRepository};
use queue_broker::{JobEnvelope, JobHandler, JobOutcome};
use regex::Regex;
use store::models::{EvidenceSource, FileStatus, NewEvidence, NewPoi, PoiKind, RelationshipType};
use store::{EvidenceRepository, FileRepository, PoiRepository};
use tracing::warn;

use crate::app::AppContext;
use crate::events::{BatchedFile, DirectoryTouched, FileBatch, RelationshipCandidate};
use crate::ids::poi_id;
use crate::oracle_findings::{call_with_reparse, file_analysis_system_prompt, OracleFindings};
use crate::queues;

pub struct FileAnalysisHandler {
    pub ctx: AppContext,
}

#[async_trait]
impl JobHandler for FileAnalysisHandler {
    async fn handle(&self, envelope: &JobEnvelope) -> JobOutcome {
        let batch: FileBatch = match serde_json::from_value(envelope.payload.clone()) {
            Ok(b) => b,
            Err(e) => return JobOutcome::Fail(format!("invalid file batch payload: {e}")),
        };

        let ctx = self.ctx.clone();
        let key = batch.batch_id.clone();
        let idempotency = ctx.idempotency.clone();
        let result = idempotency
            .process_if_new(&key, || async move { process_batch(&ctx, &batch).await })
            .await;

        match result {
            Ok(ProcessingResult::Success) | Ok(ProcessingResult::AlreadyProcessed) => {
                JobOutcome::Success
            }
            Ok(ProcessingResult::Failed(msg)) => JobOutcome::Retry(msg),
            Err(e) => JobOutcome::Retry(e.to_string()),
        }
    }
}

async fn process_batch(ctx: &AppContext, batch: &FileBatch) -> anyhow::Result<()> {
    let imports = deterministic_imports_pass(batch);

    for file in &batch.files {
        ctx.store
            .pois
            .upsert(&NewPoi {
                poi_id: file_poi_id(&file.path),
                file_id: file.file_id,
                kind: PoiKind::File,
                name: file.path.clone(),
                file_path: file.path.clone(),
                start_line: 0,
                end_line: 0,
                metadata: serde_json::json!({}),
            })
            .await?;
    }

    let mut candidates = Vec::new();
    for (from_path, to_path) in &imports {
        let from_id = file_poi_id(from_path);
        let to_id = file_poi_id(to_path);
        if from_id == to_id {
            continue;
        }
        ctx.store
            .evidence
            .append(&NewEvidence {
                from_poi_id: from_id.clone(),
                to_poi_id: to_id.clone(),
                relationship_type: RelationshipType::Imports,
                evidence_source: EvidenceSource::Deterministic,
                confidence: 1.0,
                metadata: serde_json::json!({}),
            })
            .await?;
        candidates.push(RelationshipCandidate {
            from_poi_id: from_id,
            to_poi_id: to_id,
            relationship_type: RelationshipType::Imports.as_str().to_string(),
            evidence_source: EvidenceSource::Deterministic.as_str().to_string(),
            confidence: 1.0,
        });
    }

    let findings = call_oracle(ctx, batch).await?;

    let mut poi_ids_by_name: HashMap<String, String> = HashMap::new();
    for poi in &findings.pois {
        if batch.files.iter().any(|f| f.path == poi.file_path) {
            poi_ids_by_name.insert(
                poi.name.clone(),
                poi_id(&poi.file_path, &poi.kind, &poi.name, poi.start_line),
            );
        }
    }

    for poi in &findings.pois {
        let Some(file) = batch.files.iter().find(|f| f.path == poi.file_path) else {
            warn!(path = %poi.file_path, "oracle tagged POI with a file outside this batch, skipping");
            continue;
        };
        let Some(kind) = PoiKind::parse(&poi.kind) else {
            warn!(kind = %poi.kind, "unknown POI kind from oracle, skipping");
            continue;
        };
        ctx.store
            .pois
            .upsert(&NewPoi {
                poi_id: poi_id(&poi.file_path, &poi.kind, &poi.name, poi.start_line),
                file_id: file.file_id,
                kind,
                name: poi.name.clone(),
                file_path: poi.file_path.clone(),
                start_line: poi.start_line,
                end_line: poi.end_line,
                metadata: serde_json::json!({}),
            })
            .await?;
    }

    for rel in &findings.relationships {
        record_candidate(
            ctx,
            &poi_ids_by_name,
            &rel.from_name,
            &rel.to_name,
            &rel.relationship_type,
            EvidenceSource::IntraFile,
            rel.confidence,
            &mut candidates,
        )
        .await?;
    }

    let mut touched = Vec::new();
    for file in &batch.files {
        ctx.store
            .files
            .advance_status(file.file_id, FileStatus::Analyzed)
            .await?;
        if let Some(parent) = std::path::Path::new(&file.path).parent() {
            touched.push(DirectoryTouched {
                directory_path: parent.to_string_lossy().to_string(),
                file_path: file.path.clone(),
            });
        }
    }

    let mut tx = ctx.pool.begin().await?;

    for candidate in &candidates {
        let event = OutboxEvent::new(
            "relationship.candidate",
            queues::RELATIONSHIP_VALIDATED,
            serde_json::to_value(candidate)?,
        );
        ctx.outbox.insert(&mut tx, &event).await?;
    }
    for touch in &touched {
        let event = OutboxEvent::new(
            "directory.touched",
            queues::DIRECTORY_AGGREGATION,
            serde_json::to_value(touch)?,
        );
        ctx.outbox.insert(&mut tx, &event).await?;
    }
    let findings_event = OutboxEvent::new(
        "analysis.findings",
        queues::ANALYSIS_FINDINGS,
        serde_json::json!({"batch_id": batch.batch_id, "findings": findings}),
    );
    ctx.outbox.insert(&mut tx, &findings_event).await?;

    tx.commit().await?;
    Ok(())
}

async fn call_oracle(ctx: &AppContext, batch: &FileBatch) -> anyhow::Result<OracleFindings> {
    let user = serde_json::to_string(
        &batch
            .files
            .iter()
            .map(|f| serde_json::json!({"path": f.path, "content": f.content}))
            .collect::<Vec<_>>(),
    )?;

    call_with_reparse(&ctx.oracle, "file-analysis", file_analysis_system_prompt(), &user).await
}

#[allow(clippy::too_many_arguments)]
async fn record_candidate(
    ctx: &AppContext,
    poi_ids_by_name: &HashMap<String, String>,
    from_name: &str,
    to_name: &str,
    relationship_type: &str,
    source: EvidenceSource,
    confidence: f64,
    candidates: &mut Vec<RelationshipCandidate>,
) -> anyhow::Result<()> {
    let (Some(from_id), Some(to_id)) =
        (poi_ids_by_name.get(from_name), poi_ids_by_name.get(to_name))
    else {
        return Ok(());
    };
    let Some(rel_type) = RelationshipType::parse(relationship_type) else {
        return Ok(());
    };
    if from_id == to_id {
        return Ok(());
    }

    ctx.store
        .evidence
        .append(&NewEvidence {
            from_poi_id: from_id.clone(),
            to_poi_id: to_id.clone(),
            relationship_type: rel_type,
            evidence_source: source,
            confidence,
            metadata: serde_json::json!({}),
        })
        .await?;

    candidates.push(RelationshipCandidate {
        from_poi_id: from_id.clone(),
        to_poi_id: to_id.clone(),
        relationship_type: rel_type.as_str().to_string(),
        evidence_source: source.as_str().to_string(),
        confidence,
    });

    Ok(())
}

fn file_poi_id(path: &str) -> String {
    poi_id(path, "file", path, 0)
}

/// Import/require statement patterns across the languages the batch is
/// likely to contain. Each capture group is the imported module path or
/// specifier as written in source, resolved against the batch's own files
/// below — this pass never calls the oracle and never requires an LLM
/// judgment to exist.
static IMPORT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r#"(?m)^\s*use\s+(?:crate::|self::|super::)?([\w:]+)"#).unwrap(),
        Regex::new(r#"(?m)^\s*mod\s+(\w+)\s*;"#).unwrap(),
        Regex::new(r#"(?m)import\s+.*?from\s+['"]([^'"]+)['"]"#).unwrap(),
        Regex::new(r#"(?m)require\(\s*['"]([^'"]+)['"]\s*\)"#).unwrap(),
        Regex::new(r#"(?m)^\s*from\s+([\w.]+)\s+import\b"#).unwrap(),
        Regex::new(r#"(?m)^\s*import\s+([\w.]+)\s*$"#).unwrap(),
    ]
});

/// Runs before the oracle call and depends only on raw batch content: for
/// every import/require statement found, resolves its target specifier
/// against the other files in the same batch by path stem and records the
/// pair if a match is found. Imports naming a file outside the batch (most
/// third-party and cross-directory imports) are left for the oracle and
/// later resolution workers to pick up; this pass only emits the pairs it
/// can resolve deterministically.
fn deterministic_imports_pass(batch: &FileBatch) -> Vec<(String, String)> {
    let mut hints = Vec::new();
    for file in &batch.files {
        for pattern in IMPORT_PATTERNS.iter() {
            for capture in pattern.captures_iter(&file.content) {
                let Some(specifier) = capture.get(1) else { continue };
                if let Some(target) = resolve_specifier(batch, &file.path, specifier.as_str()) {
                    hints.push((file.path.clone(), target));
                }
            }
        }
    }
    hints.sort();
    hints.dedup();
    hints
}

/// Resolves an import specifier to a file already present in the batch by
/// comparing path stems (the specifier's last segment, split on `.`, `::`,
/// or `/`) against each candidate file's own stem.
fn resolve_specifier(batch: &FileBatch, importer_path: &str, specifier: &str) -> Option<String> {
    let last_segment = specifier.split(|c| c == '/' || c == ':' || c == '.').filter(|s| !s.is_empty()).last()?;
    batch
        .files
        .iter()
        .filter(|f| f.path != importer_path)
        .find(|f| file_stem(&f.path).eq_ignore_ascii_case(last_segment))
        .map(|f| f.path.clone())
}

fn file_stem(path: &str) -> &str {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.split('.').next().unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batched(path: &str, content: &str) -> BatchedFile {
        BatchedFile {
            file_id: 1,
            path: path.to_string(),
            content: content.to_string(),
            content_hash: "hash".to_string(),
        }
    }

    #[test]
    fn test_file_stem_strips_directory_and_extension() {
        assert_eq!(file_stem("src/widget.rs"), "widget");
        assert_eq!(file_stem("widget.rs"), "widget");
        assert_eq!(file_stem("widget"), "widget");
    }

    #[test]
    fn test_deterministic_imports_pass_finds_rust_use_statement() {
        let batch = FileBatch {
            batch_id: "b1".to_string(),
            files: vec![
                batched("src/widget.rs", "pub fn make_widget() {}"),
                batched("src/main.rs", "use crate::widget::make_widget;\nfn main() { make_widget(); }"),
            ],
        };

        let hints = deterministic_imports_pass(&batch);
        assert_eq!(hints, vec![("src/main.rs".to_string(), "src/widget.rs".to_string())]);
    }

    #[test]
    fn test_deterministic_imports_pass_finds_js_import_statement() {
        let batch = FileBatch {
            batch_id: "b1".to_string(),
            files: vec![
                batched("widget.js", "export function makeWidget() {}"),
                batched("main.js", "import { makeWidget } from './widget';\nmakeWidget();"),
            ],
        };

        let hints = deterministic_imports_pass(&batch);
        assert_eq!(hints, vec![("main.js".to_string(), "widget.js".to_string())]);
    }

    #[test]
    fn test_deterministic_imports_pass_ignores_specifiers_outside_the_batch() {
        let batch = FileBatch {
            batch_id: "b1".to_string(),
            files: vec![batched("src/main.rs", "use serde::Serialize;\nfn main() {}")],
        };

        assert!(deterministic_imports_pass(&batch).is_empty());
    }

    #[test]
    fn test_resolve_specifier_matches_by_stem_case_insensitively() {
        let batch = FileBatch {
            batch_id: "b1".to_string(),
            files: vec![batched("src/Widget.rs", ""), batched("src/main.rs", "")],
        };

        assert_eq!(
            resolve_specifier(&batch, "src/main.rs", "widget"),
            Some("src/Widget.rs".to_string())
        );
    }
}
