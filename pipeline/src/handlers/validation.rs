//! Validation Worker (C7, spec §4.7).
//!
//! Consumes every relationship candidate fanned in from C4, C5, and C6,
//! rejects structurally invalid ones (unknown type, missing endpoint POI,
//! self-loop), and forwards a reconciliation trigger for the surviving
//! `(from, to, type)` key. The candidate's own evidence was already
//! appended to the store by whichever worker produced it; this worker only
//! decides whether the pair is worth reconciling.

use async_trait::async_trait;
use outbox::{OutboxEvent, OutboxRepository};
use queue_broker::{JobEnvelope, JobHandler, JobOutcome};
use store::models::RelationshipType;
use store::PoiRepository;
use tracing::warn;

use crate::app::AppContext;
use crate::events::{ReconciliationKey, RelationshipCandidate};
use crate::queues;

pub struct ValidationHandler {
    pub ctx: AppContext,
}

#[async_trait]
impl JobHandler for ValidationHandler {
    async fn handle(&self, envelope: &JobEnvelope) -> JobOutcome {
        let candidate: RelationshipCandidate = match serde_json::from_value(envelope.payload.clone()) {
            Ok(c) => c,
            Err(e) => return JobOutcome::Fail(format!("invalid relationship candidate payload: {e}")),
        };

        match validate(&self.ctx, &candidate).await {
            Ok(()) => JobOutcome::Success,
            Err(ValidationError::UnknownEndpoint) => JobOutcome::Fail("unknown_endpoint".to_string()),
            Err(ValidationError::Other(e)) => JobOutcome::Retry(e.to_string()),
        }
    }
}

fn is_self_loop(candidate: &RelationshipCandidate) -> bool {
    candidate.from_poi_id == candidate.to_poi_id
}

/// Distinguishes a candidate that should be silently dropped (self-loop,
/// unknown relationship type — structurally malformed but not worth a
/// dead-letter) from one that references a POI that does not exist, which
/// spec §7 requires to surface as a failed job rather than a quiet success.
enum ValidationError {
    UnknownEndpoint,
    Other(anyhow::Error),
}

impl<E: Into<anyhow::Error>> From<E> for ValidationError {
    fn from(e: E) -> Self {
        ValidationError::Other(e.into())
    }
}

async fn validate(ctx: &AppContext, candidate: &RelationshipCandidate) -> Result<(), ValidationError> {
    if is_self_loop(candidate) {
        warn!(poi_id = %candidate.from_poi_id, "dropping self-loop relationship candidate");
        return Ok(());
    }

    let Some(relationship_type) = RelationshipType::parse(&candidate.relationship_type) else {
        warn!(relationship_type = %candidate.relationship_type, "dropping candidate with unknown relationship type");
        return Ok(());
    };

    if !ctx.store.pois.exists(&candidate.from_poi_id).await? || !ctx.store.pois.exists(&candidate.to_poi_id).await? {
        warn!(
            from = %candidate.from_poi_id,
            to = %candidate.to_poi_id,
            "dropping candidate referencing an unknown POI"
        );
        return Err(ValidationError::UnknownEndpoint);
    }

    let mut tx = ctx.pool.begin().await?;
    let event = OutboxEvent::new(
        "reconciliation.triggered",
        queues::RECONCILIATION,
        serde_json::to_value(ReconciliationKey {
            from_poi_id: candidate.from_poi_id.clone(),
            to_poi_id: candidate.to_poi_id.clone(),
            relationship_type: relationship_type.as_str().to_string(),
        })?,
    );
    ctx.outbox.insert(&mut tx, &event).await?;
    tx.commit().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(from: &str, to: &str) -> RelationshipCandidate {
        RelationshipCandidate {
            from_poi_id: from.to_string(),
            to_poi_id: to.to_string(),
            relationship_type: "calls".to_string(),
            evidence_source: "intra_file".to_string(),
            confidence: 0.9,
        }
    }

    #[test]
    fn test_is_self_loop_true_when_endpoints_match() {
        assert!(is_self_loop(&candidate("poi-1", "poi-1")));
    }

    #[test]
    fn test_is_self_loop_false_when_endpoints_differ() {
        assert!(!is_self_loop(&candidate("poi-1", "poi-2")));
    }

    #[test]
    fn test_unknown_relationship_type_does_not_parse() {
        assert!(RelationshipType::parse("frobnicates").is_none());
    }
}
