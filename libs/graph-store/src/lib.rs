//! Graph store adapter (C9 Graph Builder's sink).
//!
//! Bulk-loads accepted POIs and relationships into Neo4j, keyed by `poi_id`.
//! The graph store is a materialized derivative of the relational store's
//! accepted-relationship table, rebuilt per run; it owns no authoritative
//! state. Nodes are labeled by POI kind (`Function`, `Class`, `Variable`,
//! `File`, `Directory`); edges are typed by relationship kind (`CALLS`,
//! `IMPORTS`, `CONTAINS`, `REFERENCES`).

mod error;

pub use error::{GraphStoreError, GraphStoreResult};

use neo4rs::{query, Graph};
use resilience::{graph_store_config, CircuitBreaker};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// A Point of Interest node to upsert into the graph.
#[derive(Debug, Clone)]
pub struct PoiNode {
    pub poi_id: String,
    pub kind: PoiKind,
    pub name: String,
    pub file_path: String,
    pub start_line: i64,
    pub end_line: i64,
    pub metadata: Value,
}

/// POI kinds, mapped to Neo4j node labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoiKind {
    Function,
    Class,
    Variable,
    File,
    Directory,
}

impl PoiKind {
    /// Neo4j node label for this kind.
    pub fn label(&self) -> &'static str {
        match self {
            PoiKind::Function => "Function",
            PoiKind::Class => "Class",
            PoiKind::Variable => "Variable",
            PoiKind::File => "File",
            PoiKind::Directory => "Directory",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "function" => Some(PoiKind::Function),
            "class" => Some(PoiKind::Class),
            "variable" => Some(PoiKind::Variable),
            "file" => Some(PoiKind::File),
            "directory" => Some(PoiKind::Directory),
            _ => None,
        }
    }
}

/// An accepted relationship edge to upsert into the graph.
#[derive(Debug, Clone)]
pub struct RelationshipEdge {
    pub from_poi_id: String,
    pub to_poi_id: String,
    pub relationship_type: RelationshipType,
    pub confidence_score: f64,
    pub metadata: Value,
}

/// Relationship kinds, mapped to Neo4j edge types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationshipType {
    Calls,
    Imports,
    Contains,
    References,
}

impl RelationshipType {
    /// Neo4j relationship type for this kind.
    pub fn edge_type(&self) -> &'static str {
        match self {
            RelationshipType::Calls => "CALLS",
            RelationshipType::Imports => "IMPORTS",
            RelationshipType::Contains => "CONTAINS",
            RelationshipType::References => "REFERENCES",
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

/// Repository for the pipeline's graph operations, backed by Neo4j.
#[derive(Clone)]
pub struct GraphRepository {
    graph: Arc<Graph>,
    breaker: Arc<CircuitBreaker>,
}

impl GraphRepository {
    pub async fn new(uri: &str, user: &str, password: &str) -> GraphStoreResult<Self> {
        let graph = Graph::new(uri, user, password)
            .await
            .map_err(|e| GraphStoreError::Connection(e.to_string()))?;

        Ok(Self {
            graph: Arc::new(graph),
            breaker: Arc::new(CircuitBreaker::new(graph_store_config().circuit_breaker)),
        })
    }

    /// Verify connectivity to Neo4j.
    pub async fn health_check(&self) -> GraphStoreResult<bool> {
        let mut result = self
            .graph
            .execute(query("RETURN 1 AS health"))
            .await
            .map_err(|e| GraphStoreError::Query(e.to_string()))?;

        if let Some(row) = result.next().await.map_err(|e| GraphStoreError::Query(e.to_string()))? {
            let health: i64 = row.get("health").unwrap_or(0);
            Ok(health == 1)
        } else {
            Ok(false)
        }
    }

    /// Upsert a POI node. Idempotent via `MERGE` on `poi_id`.
    pub async fn upsert_poi(&self, poi: &PoiNode) -> GraphStoreResult<()> {
        let cypher = format!(
            r#"
            MERGE (n:{label} {{poi_id: $poi_id}})
            ON CREATE SET n.created_at = timestamp()
            SET n.name = $name,
                n.file_path = $file_path,
                n.start_line = $start_line,
                n.end_line = $end_line,
                n.metadata = $metadata
            "#,
            label = poi.kind.label()
        );

        let graph = self.graph.clone();
        let q = query(&cypher)
            .param("poi_id", poi.poi_id.clone())
            .param("name", poi.name.clone())
            .param("file_path", poi.file_path.clone())
            .param("start_line", poi.start_line)
            .param("end_line", poi.end_line)
            .param("metadata", poi.metadata.to_string());

        self.breaker
            .call(|| async move {
                let mut result = graph.execute(q).await?;
                while result.next().await?.is_some() {}
                Ok::<_, neo4rs::Error>(())
            })
            .await
            .map_err(|e| GraphStoreError::Query(e.to_string()))?;

        debug!(poi_id = %poi.poi_id, label = poi.kind.label(), "upserted POI node");
        Ok(())
    }

    /// Upsert a batch of POI nodes in a single `UNWIND`.
    pub async fn upsert_pois(&self, pois: &[PoiNode]) -> GraphStoreResult<()> {
        // Group by label: Neo4j labels cannot be parameterized.
        use std::collections::HashMap;
        let mut by_label: HashMap<&'static str, Vec<&PoiNode>> = HashMap::new();
        for poi in pois {
            by_label.entry(poi.kind.label()).or_default().push(poi);
        }

        for (label, group) in by_label {
            let poi_ids: Vec<String> = group.iter().map(|p| p.poi_id.clone()).collect();
            let names: Vec<String> = group.iter().map(|p| p.name.clone()).collect();
            let file_paths: Vec<String> = group.iter().map(|p| p.file_path.clone()).collect();
            let start_lines: Vec<i64> = group.iter().map(|p| p.start_line).collect();
            let end_lines: Vec<i64> = group.iter().map(|p| p.end_line).collect();
            let metadatas: Vec<String> = group.iter().map(|p| p.metadata.to_string()).collect();

            let cypher = format!(
                r#"
                UNWIND range(0, size($poi_ids) - 1) AS idx
                MERGE (n:{label} {{poi_id: $poi_ids[idx]}})
                ON CREATE SET n.created_at = timestamp()
                SET n.name = $names[idx],
                    n.file_path = $file_paths[idx],
                    n.start_line = $start_lines[idx],
                    n.end_line = $end_lines[idx],
                    n.metadata = $metadatas[idx]
                "#
            );

            let graph = self.graph.clone();
            let q = query(&cypher)
                .param("poi_ids", poi_ids)
                .param("names", names)
                .param("file_paths", file_paths)
                .param("start_lines", start_lines)
                .param("end_lines", end_lines)
                .param("metadatas", metadatas);

            self.breaker
                .call(|| async move {
                    let mut result = graph.execute(q).await?;
                    while result.next().await?.is_some() {}
                    Ok::<_, neo4rs::Error>(())
                })
                .await
                .map_err(|e| GraphStoreError::Query(e.to_string()))?;

            debug!(label, count = group.len(), "bulk-upserted POI nodes");
        }

        Ok(())
    }

    /// Upsert an accepted relationship edge. Idempotent via `MERGE`.
    pub async fn upsert_relationship(&self, edge: &RelationshipEdge) -> GraphStoreResult<()> {
        let cypher = format!(
            r#"
            MATCH (a {{poi_id: $from_id}}), (b {{poi_id: $to_id}})
            MERGE (a)-[r:{edge_type}]->(b)
            SET r.confidence_score = $confidence_score,
                r.metadata = $metadata
            "#,
            edge_type = edge.relationship_type.edge_type()
        );

        let graph = self.graph.clone();
        let q = query(&cypher)
            .param("from_id", edge.from_poi_id.clone())
            .param("to_id", edge.to_poi_id.clone())
            .param("confidence_score", edge.confidence_score)
            .param("metadata", edge.metadata.to_string());

        self.breaker
            .call(|| async move {
                let mut result = graph.execute(q).await?;
                while result.next().await?.is_some() {}
                Ok::<_, neo4rs::Error>(())
            })
            .await
            .map_err(|e| GraphStoreError::Query(e.to_string()))?;

        debug!(
            from = %edge.from_poi_id,
            to = %edge.to_poi_id,
            kind = edge.relationship_type.edge_type(),
            "upserted relationship edge"
        );
        Ok(())
    }

    /// Count nodes and edges currently in the graph, by label/type.
    pub async fn stats(&self) -> GraphStoreResult<GraphStats> {
        let cypher = r#"
            MATCH (n)
            WITH count(n) AS node_count
            MATCH ()-[r]->()
            RETURN node_count, count(r) AS edge_count
        "#;

        let mut result = self
            .graph
            .execute(query(cypher))
            .await
            .map_err(|e| GraphStoreError::Query(e.to_string()))?;

        if let Some(row) = result.next().await.map_err(|e| GraphStoreError::Query(e.to_string()))? {
            Ok(GraphStats {
                node_count: row.get("node_count").unwrap_or(0),
                edge_count: row.get("edge_count").unwrap_or(0),
            })
        } else {
            Ok(GraphStats::default())
        }
    }

    /// Delete all nodes and edges. Used at the start of a whole-tree sweep
    /// per the non-goal ruling out incremental re-analysis (SPEC_FULL.md §1).
    pub async fn clear(&self) -> GraphStoreResult<()> {
        self.graph
            .run(query("MATCH (n) DETACH DELETE n"))
            .await
            .map_err(|e| GraphStoreError::Query(e.to_string()))?;
        debug!("cleared graph store");
        Ok(())
    }
}

/// Node/edge counts for the graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphStats {
    pub node_count: i64,
    pub edge_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poi_kind_label_roundtrip() {
        for kind in [
            PoiKind::Function,
            PoiKind::Class,
            PoiKind::Variable,
            PoiKind::File,
            PoiKind::Directory,
        ] {
            let label = kind.label();
            assert_eq!(PoiKind::parse(label).unwrap().label(), label);
        }
    }

    #[test]
    fn test_poi_kind_parse_unknown() {
        assert!(PoiKind::parse("nonsense").is_none());
    }

    #[test]
    fn test_relationship_type_edge_type_roundtrip() {
        for kind in [
            RelationshipType::Calls,
            RelationshipType::Imports,
            RelationshipType::Contains,
            RelationshipType::References,
        ] {
            let edge_type = kind.edge_type();
            assert_eq!(
                RelationshipType::parse(edge_type).unwrap().edge_type(),
                edge_type
            );
        }
    }

    #[test]
    fn test_relationship_type_parse_case_insensitive() {
        assert_eq!(RelationshipType::parse("CALLS"), Some(RelationshipType::Calls));
        assert_eq!(RelationshipType::parse("calls"), Some(RelationshipType::Calls));
    }

    // NOTE: These tests require a running Neo4j instance.
    // Run with: docker run -p 7687:7687 -e NEO4J_AUTH=neo4j/password neo4j:5

    #[tokio::test]
    #[ignore] // run manually with: cargo test -- --ignored
    async fn test_upsert_poi_and_relationship() {
        let repo = GraphRepository::new("bolt://localhost:7687", "neo4j", "password")
            .await
            .expect("failed to connect to Neo4j");

        let a = PoiNode {
            poi_id: "src/main.rs:function:main:1".to_string(),
            kind: PoiKind::Function,
            name: "main".to_string(),
            file_path: "src/main.rs".to_string(),
            start_line: 1,
            end_line: 10,
            metadata: serde_json::json!({}),
        };
        let b = PoiNode {
            poi_id: "src/lib.rs:function:run:1".to_string(),
            kind: PoiKind::Function,
            name: "run".to_string(),
            file_path: "src/lib.rs".to_string(),
            start_line: 1,
            end_line: 5,
            metadata: serde_json::json!({}),
        };

        repo.upsert_poi(&a).await.unwrap();
        repo.upsert_poi(&b).await.unwrap();

        repo.upsert_relationship(&RelationshipEdge {
            from_poi_id: a.poi_id.clone(),
            to_poi_id: b.poi_id.clone(),
            relationship_type: RelationshipType::Calls,
            confidence_score: 0.95,
            metadata: serde_json::json!({}),
        })
        .await
        .unwrap();

        let stats = repo.stats().await.unwrap();
        assert!(stats.node_count >= 2);
        assert!(stats.edge_count >= 1);
    }
}
