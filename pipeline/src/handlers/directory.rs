//! Directory Aggregation & Resolution Worker (C5, spec §4.5).
//!
//! Two phases sharing a file: aggregation consumes `directory-aggregation-queue`
//! (`DirectoryTouched`, one per analyzed file) and, once every file under a
//! directory has reached `analyzed`, emits a `DirectoryReady` onto
//! `directory-resolution-queue`. Resolution consumes that event, calls the
//! oracle with the directory's full POI set, and emits `intra_directory`
//! evidence plus cross-directory hints.

use async_trait::async_trait;
use idempotent_consumer::ProcessingResult;
use outbox::{OutboxEvent, OutboxRepository};
use queue_broker::{JobEnvelope, JobHandler, JobOutcome};
use sqlx::Row;
use store::models::{EvidenceSource, NewEvidence, RelationshipType};
use store::EvidenceRepository;
use tracing::info;

use crate::app::AppContext;
use crate::events::{DirectoryReady, DirectoryTouched, RelationshipCandidate, ResolutionHint};
use crate::oracle_findings::{call_with_reparse, directory_resolution_system_prompt};
use crate::queues;

pub struct DirectoryAggregationHandler {
    pub ctx: AppContext,
}

#[async_trait]
impl JobHandler for DirectoryAggregationHandler {
    async fn handle(&self, envelope: &JobEnvelope) -> JobOutcome {
        let touch: DirectoryTouched = match serde_json::from_value(envelope.payload.clone()) {
            Ok(t) => t,
            Err(e) => return JobOutcome::Fail(format!("invalid directory-touched payload: {e}")),
        };

        let ctx = self.ctx.clone();
        let key = format!("directory-touch:{}", touch.file_path);
        let idempotency = ctx.idempotency.clone();
        let result = idempotency
            .process_if_new(&key, || async move { aggregate(&ctx, &touch).await })
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

fn directory_like_pattern(directory_path: &str) -> String {
    format!("{directory_path}/%")
}

async fn aggregate(ctx: &AppContext, touch: &DirectoryTouched) -> anyhow::Result<()> {
    let like_pattern = directory_like_pattern(&touch.directory_path);
    let pending: i64 = sqlx::query(
        "SELECT COUNT(*) AS pending FROM files WHERE path LIKE ? AND status != 'analyzed'",
    )
    .bind(&like_pattern)
    .fetch_one(&ctx.pool)
    .await?
    .try_get("pending")?;

    if pending > 0 {
        return Ok(());
    }

    let file_ids: Vec<i64> = sqlx::query("SELECT id FROM files WHERE path LIKE ?")
        .bind(&like_pattern)
        .fetch_all(&ctx.pool)
        .await?
        .into_iter()
        .map(|row| row.try_get("id"))
        .collect::<Result<_, _>>()?;

    let mut poi_ids = Vec::new();
    let mut names = Vec::new();
    for file_id in file_ids {
        for poi in ctx.store.pois.list_by_file(file_id).await? {
            poi_ids.push(poi.poi_id.clone());
            names.push(poi.name.clone());
        }
    }

    if poi_ids.is_empty() {
        return Ok(());
    }

    ctx.store
        .directory_summaries
        .upsert(&touch.directory_path, &names.join(", "), serde_json::json!({}))
        .await?;

    let mut tx = ctx.pool.begin().await?;
    let event = OutboxEvent::new(
        "directory.ready",
        queues::DIRECTORY_RESOLUTION,
        serde_json::to_value(DirectoryReady {
            directory_path: touch.directory_path.clone(),
            poi_ids,
        })?,
    );
    ctx.outbox.insert(&mut tx, &event).await?;
    tx.commit().await?;

    info!(directory = %touch.directory_path, "directory fully analyzed, queued for resolution");
    Ok(())
}

pub struct DirectoryResolutionHandler {
    pub ctx: AppContext,
}

#[async_trait]
impl JobHandler for DirectoryResolutionHandler {
    async fn handle(&self, envelope: &JobEnvelope) -> JobOutcome {
        let ready: DirectoryReady = match serde_json::from_value(envelope.payload.clone()) {
            Ok(r) => r,
            Err(e) => return JobOutcome::Fail(format!("invalid directory-ready payload: {e}")),
        };

        let ctx = self.ctx.clone();
        let key = format!("directory-resolve:{}", ready.directory_path);
        let idempotency = ctx.idempotency.clone();
        let result = idempotency
            .process_if_new(&key, || async move { resolve(&ctx, &ready).await })
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

async fn resolve(ctx: &AppContext, ready: &DirectoryReady) -> anyhow::Result<()> {
    let mut records = Vec::with_capacity(ready.poi_ids.len());
    for poi_id in &ready.poi_ids {
        records.push(ctx.store.pois.get(poi_id).await?);
    }

    let user = serde_json::to_string(
        &records
            .iter()
            .map(|p| serde_json::json!({"name": p.name, "kind": p.kind, "file_path": p.file_path}))
            .collect::<Vec<_>>(),
    )?;

    let findings = call_with_reparse(
        &ctx.oracle,
        "directory-resolution",
        directory_resolution_system_prompt(),
        &user,
    )
    .await?;

    let mut candidates = Vec::new();
    let mut hints = Vec::new();

    for rel in &findings.relationships {
        let from = records.iter().find(|p| p.name == rel.from_name);
        let to = records.iter().find(|p| p.name == rel.to_name);
        let Some(rel_type) = RelationshipType::parse(&rel.relationship_type) else {
            continue;
        };

        match (from, to) {
            (Some(from), Some(to)) if from.poi_id != to.poi_id => {
                ctx.store
                    .evidence
                    .append(&NewEvidence {
                        from_poi_id: from.poi_id.clone(),
                        to_poi_id: to.poi_id.clone(),
                        relationship_type: rel_type,
                        evidence_source: EvidenceSource::IntraDirectory,
                        confidence: rel.confidence,
                        metadata: serde_json::json!({}),
                    })
                    .await?;
                candidates.push(RelationshipCandidate {
                    from_poi_id: from.poi_id.clone(),
                    to_poi_id: to.poi_id.clone(),
                    relationship_type: rel_type.as_str().to_string(),
                    evidence_source: EvidenceSource::IntraDirectory.as_str().to_string(),
                    confidence: rel.confidence,
                });
            }
            (Some(from), None) => {
                hints.push(ResolutionHint {
                    from_poi_id: from.poi_id.clone(),
                    unresolved_name: rel.to_name.clone(),
                    candidate_poi_ids: Vec::new(),
                });
            }
            _ => {}
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
    for hint in &hints {
        let event = OutboxEvent::new(
            "resolution.hint",
            queues::RELATIONSHIP_RESOLUTION,
            serde_json::to_value(hint)?,
        );
        ctx.outbox.insert(&mut tx, &event).await?;
    }
    tx.commit().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_like_pattern_matches_only_descendants() {
        assert_eq!(directory_like_pattern("src/handlers"), "src/handlers/%");
    }
}
