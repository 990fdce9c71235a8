//! Relationship Resolution Worker (C6, spec §4.6).
//!
//! Consumes cross-directory hints that C5 couldn't resolve locally, samples
//! candidate POIs elsewhere in the repository by name, and asks the oracle
//! to judge whether a relationship plausibly exists at whole-repository
//! scope. Confidence from this scope is deliberately the lowest of the three
//! (`global` weight 0.4, spec §4.8) since it never sees source text directly.

use async_trait::async_trait;
use idempotent_consumer::ProcessingResult;
use outbox::{OutboxEvent, OutboxRepository};
use queue_broker::{JobEnvelope, JobHandler, JobOutcome};
use sqlx::Row;
use store::models::{EvidenceSource, NewEvidence, RelationshipType};
use store::EvidenceRepository;

use crate::app::AppContext;
use crate::events::{RelationshipCandidate, ResolutionHint};
use crate::oracle_findings::{call_with_reparse, global_resolution_system_prompt};
use crate::queues;

const MAX_CANDIDATES: i64 = 10;

fn resolve_candidate_by_name<'a>(candidates: &'a [(String, String)], name: &str) -> Option<&'a String> {
    candidates.iter().find(|(_, n)| n == name).map(|(poi_id, _)| poi_id)
}

pub struct GlobalResolutionHandler {
    pub ctx: AppContext,
}

#[async_trait]
impl JobHandler for GlobalResolutionHandler {
    async fn handle(&self, envelope: &JobEnvelope) -> JobOutcome {
        let hint: ResolutionHint = match serde_json::from_value(envelope.payload.clone()) {
            Ok(h) => h,
            Err(e) => return JobOutcome::Fail(format!("invalid resolution-hint payload: {e}")),
        };

        let ctx = self.ctx.clone();
        let key = format!("global-resolve:{}:{}", hint.from_poi_id, hint.unresolved_name);
        let idempotency = ctx.idempotency.clone();
        let result = idempotency
            .process_if_new(&key, || async move { resolve(&ctx, &hint).await })
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

async fn resolve(ctx: &AppContext, hint: &ResolutionHint) -> anyhow::Result<()> {
    let from = ctx.store.pois.get(&hint.from_poi_id).await?;

    let candidate_rows = sqlx::query(
        "SELECT poi_id, name, kind, file_path FROM pois WHERE name = ? AND poi_id != ? LIMIT ?",
    )
    .bind(&hint.unresolved_name)
    .bind(&hint.from_poi_id)
    .bind(MAX_CANDIDATES)
    .fetch_all(&ctx.pool)
    .await?;

    if candidate_rows.is_empty() {
        return Ok(());
    }

    let candidates: Vec<(String, String)> = candidate_rows
        .iter()
        .map(|row| -> anyhow::Result<(String, String)> {
            Ok((row.try_get::<String, _>("poi_id")?, row.try_get::<String, _>("name")?))
        })
        .collect::<Result<_, _>>()?;

    let user = serde_json::to_string(&serde_json::json!({
        "from": {"name": from.name, "kind": from.kind, "file_path": from.file_path},
        "unresolved_reference": hint.unresolved_name,
        "candidates": candidate_rows.iter().map(|row| {
            serde_json::json!({
                "name": row.try_get::<String, _>("name").unwrap_or_default(),
                "kind": row.try_get::<String, _>("kind").unwrap_or_default(),
                "file_path": row.try_get::<String, _>("file_path").unwrap_or_default(),
            })
        }).collect::<Vec<_>>(),
    }))?;

    let findings = call_with_reparse(
        &ctx.oracle,
        "global-resolution",
        global_resolution_system_prompt(),
        &user,
    )
    .await?;

    let Some(rel) = findings.relationships.first() else {
        return Ok(());
    };
    let Some(rel_type) = RelationshipType::parse(&rel.relationship_type) else {
        return Ok(());
    };
    let Some(to_poi_id) = resolve_candidate_by_name(&candidates, &rel.to_name) else {
        return Ok(());
    };

    ctx.store
        .evidence
        .append(&NewEvidence {
            from_poi_id: from.poi_id.clone(),
            to_poi_id: to_poi_id.clone(),
            relationship_type: rel_type,
            evidence_source: EvidenceSource::Global,
            confidence: rel.confidence,
            metadata: serde_json::json!({}),
        })
        .await?;

    let candidate = RelationshipCandidate {
        from_poi_id: from.poi_id.clone(),
        to_poi_id: to_poi_id.clone(),
        relationship_type: rel_type.as_str().to_string(),
        evidence_source: EvidenceSource::Global.as_str().to_string(),
        confidence: rel.confidence,
    };

    let mut tx = ctx.pool.begin().await?;
    let event = OutboxEvent::new(
        "relationship.candidate",
        queues::RELATIONSHIP_VALIDATED,
        serde_json::to_value(&candidate)?,
    );
    ctx.outbox.insert(&mut tx, &event).await?;
    tx.commit().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_candidate_by_name_finds_match() {
        let candidates = vec![
            ("poi-1".to_string(), "Widget".to_string()),
            ("poi-2".to_string(), "Gadget".to_string()),
        ];
        assert_eq!(resolve_candidate_by_name(&candidates, "Gadget"), Some(&"poi-2".to_string()));
    }

    #[test]
    fn test_resolve_candidate_by_name_returns_none_when_absent() {
        let candidates = vec![("poi-1".to_string(), "Widget".to_string())];
        assert_eq!(resolve_candidate_by_name(&candidates, "Missing"), None);
    }
}
