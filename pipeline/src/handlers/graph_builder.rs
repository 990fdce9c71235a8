//! Graph Builder (C9, spec §4.9).
//!
//! Consumes accepted relationships and materializes both endpoints plus the
//! edge between them into Neo4j. The graph is a rebuildable projection of
//! the relational store (`relationships` + `pois`), so every write here is
//! an idempotent `MERGE` — redelivery is harmless.

use async_trait::async_trait;
use graph_store::{PoiKind as GraphPoiKind, PoiNode, RelationshipEdge, RelationshipType as GraphRelationshipType};
use queue_broker::{JobEnvelope, JobHandler, JobOutcome};
use store::PoiRepository;

use crate::app::AppContext;
use crate::events::AcceptedRelationship;

pub struct GraphBuilderHandler {
    pub ctx: AppContext,
}

#[async_trait]
impl JobHandler for GraphBuilderHandler {
    async fn handle(&self, envelope: &JobEnvelope) -> JobOutcome {
        let accepted: AcceptedRelationship = match serde_json::from_value(envelope.payload.clone()) {
            Ok(a) => a,
            Err(e) => return JobOutcome::Fail(format!("invalid accepted relationship payload: {e}")),
        };

        match build(&self.ctx, &accepted).await {
            Ok(()) => JobOutcome::Success,
            Err(e) => JobOutcome::Retry(e.to_string()),
        }
    }
}

async fn build(ctx: &AppContext, accepted: &AcceptedRelationship) -> anyhow::Result<()> {
    let Some(relationship_type) = GraphRelationshipType::parse(&accepted.relationship_type) else {
        return Ok(());
    };

    let from = ctx.store.pois.get(&accepted.from_poi_id).await?;
    let to = ctx.store.pois.get(&accepted.to_poi_id).await?;

    let from_kind = GraphPoiKind::parse(from.kind.as_str())
        .ok_or_else(|| anyhow::anyhow!("unknown poi kind: {}", from.kind.as_str()))?;
    let to_kind = GraphPoiKind::parse(to.kind.as_str())
        .ok_or_else(|| anyhow::anyhow!("unknown poi kind: {}", to.kind.as_str()))?;

    ctx.graph
        .upsert_pois(&[
            PoiNode {
                poi_id: from.poi_id.clone(),
                kind: from_kind,
                name: from.name.clone(),
                file_path: from.file_path.clone(),
                start_line: from.start_line,
                end_line: from.end_line,
                metadata: from.metadata.clone(),
            },
            PoiNode {
                poi_id: to.poi_id.clone(),
                kind: to_kind,
                name: to.name.clone(),
                file_path: to.file_path.clone(),
                start_line: to.start_line,
                end_line: to.end_line,
                metadata: to.metadata.clone(),
            },
        ])
        .await?;

    ctx.graph
        .upsert_relationship(&RelationshipEdge {
            from_poi_id: from.poi_id,
            to_poi_id: to.poi_id,
            relationship_type,
            confidence_score: accepted.confidence_score,
            metadata: serde_json::json!({}),
        })
        .await?;

    Ok(())
}
