//! Reconciliation Worker (C8, spec §4.8).
//!
//! Consumes a trigger for one `(from, to, type)` key, pulls every item of
//! Candidate Evidence recorded for that pair across every scope, and applies
//! the noisy-OR acceptance rule. Acceptance promotes (or updates) an
//! Accepted Relationship and forwards it to the Graph Builder; rejection is
//! silent — the evidence stays in the store for a future run to reconsider
//! if more evidence arrives.

use async_trait::async_trait;
use outbox::{OutboxEvent, OutboxRepository};
use queue_broker::{JobEnvelope, JobHandler, JobOutcome};
use store::models::RelationshipType;
use store::{noisy_or_confidence, should_accept, EvidenceRepository, RelationshipRepository};

use crate::app::AppContext;
use crate::events::{AcceptedRelationship, ReconciliationKey};
use crate::metrics;
use crate::queues;

pub struct ReconciliationHandler {
    pub ctx: AppContext,
}

/// `store`'s noisy-OR combiner defines its own [`store::ReconciliationWeights`]
/// rather than depending on `pipeline_config`, so the two copies are bridged
/// field-for-field here.
fn to_store_weights(cfg: &pipeline_config::ReconciliationWeights) -> store::ReconciliationWeights {
    store::ReconciliationWeights {
        deterministic: cfg.deterministic,
        intra_file: cfg.intra_file,
        intra_directory: cfg.intra_directory,
        global: cfg.global,
    }
}

#[async_trait]
impl JobHandler for ReconciliationHandler {
    async fn handle(&self, envelope: &JobEnvelope) -> JobOutcome {
        let key: ReconciliationKey = match serde_json::from_value(envelope.payload.clone()) {
            Ok(k) => k,
            Err(e) => return JobOutcome::Fail(format!("invalid reconciliation key payload: {e}")),
        };

        match reconcile(&self.ctx, &key).await {
            Ok(()) => JobOutcome::Success,
            Err(e) => JobOutcome::Retry(e.to_string()),
        }
    }
}

async fn reconcile(ctx: &AppContext, key: &ReconciliationKey) -> anyhow::Result<()> {
    let Some(relationship_type) = RelationshipType::parse(&key.relationship_type) else {
        return Ok(());
    };

    let evidence = ctx
        .store
        .evidence
        .for_pair(&key.from_poi_id, &key.to_poi_id)
        .await?
        .into_iter()
        .filter(|e| e.relationship_type == relationship_type)
        .collect::<Vec<_>>();

    if evidence.is_empty() {
        return Ok(());
    }

    let weights = to_store_weights(&ctx.config.reconciliation_weights);

    let accepted = should_accept(&evidence, &weights);
    metrics::record_reconciliation_decision(accepted);

    if !accepted {
        return Ok(());
    }

    let confidence = noisy_or_confidence(&evidence, &weights);
    let record = ctx
        .store
        .relationships
        .upsert_accepted(
            &key.from_poi_id,
            &key.to_poi_id,
            relationship_type,
            confidence,
            serde_json::json!({"evidence_count": evidence.len()}),
        )
        .await?;

    let mut tx = ctx.pool.begin().await?;
    let event = OutboxEvent::new(
        "relationship.accepted",
        queues::GRAPH_BUILDER,
        serde_json::to_value(AcceptedRelationship {
            from_poi_id: record.from_poi_id,
            to_poi_id: record.to_poi_id,
            relationship_type: relationship_type.as_str().to_string(),
            confidence_score: record.confidence_score,
        })?,
    );
    ctx.outbox.insert(&mut tx, &event).await?;
    tx.commit().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_store_weights_copies_every_field() {
        let cfg = pipeline_config::ReconciliationWeights {
            deterministic: 1.0,
            intra_file: 0.7,
            intra_directory: 0.5,
            global: 0.4,
        };
        let weights = to_store_weights(&cfg);
        assert_eq!(weights.deterministic, 1.0);
        assert_eq!(weights.intra_file, 0.7);
        assert_eq!(weights.intra_directory, 0.5);
        assert_eq!(weights.global, 0.4);
    }
}
