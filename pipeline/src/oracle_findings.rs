//! Structured JSON contract for oracle responses (spec §4.4: "oracle output
//! expected as structured JSON; worker validates the schema").
//!
//! C4, C5, and C6 all parse the oracle's free-text response body as
//! [`OracleFindings`]; a schema failure triggers exactly one reparse retry
//! with a corrective follow-up prompt before the job is treated as a
//! non-retryable failure.

use oracle_client::{OracleClient, OracleRequest};
use serde::{Deserialize, Serialize};
use std::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleFindings {
    #[serde(default)]
    pub pois: Vec<OraclePoi>,
    #[serde(default)]
    pub relationships: Vec<OracleRelationship>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OraclePoi {
    pub file_path: String,
    pub kind: String,
    pub name: String,
    pub start_line: i64,
    pub end_line: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleRelationship {
    pub from_name: String,
    pub to_name: String,
    pub relationship_type: String,
    pub confidence: f64,
}

/// Parse the oracle's response body, stripping a Markdown code fence if the
/// model wrapped the JSON in one (observed behavior, not a documented
/// contract).
pub fn parse_findings(body: &str) -> Result<OracleFindings, serde_json::Error> {
    let trimmed = strip_code_fence(body.trim());
    serde_json::from_str(trimmed)
}

fn strip_code_fence(body: &str) -> &str {
    let body = body
        .strip_prefix("```json")
        .or_else(|| body.strip_prefix("```"))
        .unwrap_or(body);
    body.strip_suffix("```").unwrap_or(body).trim()
}

pub fn file_analysis_system_prompt() -> &'static str {
    "You analyze a batch of source files and extract Points of Interest \
     (functions, classes, variables) and the intra-file relationships \
     between them (calls, imports, contains, references). Respond with \
     JSON matching {\"pois\": [{\"file_path\", \"kind\", \"name\", \
     \"start_line\", \"end_line\"}], \"relationships\": [{\"from_name\", \
     \"to_name\", \"relationship_type\", \"confidence\"}]}. Tag every POI \
     with the path of the file it was found in. Only report relationships \
     you can observe directly in the given files."
}

pub fn directory_resolution_system_prompt() -> &'static str {
    "You are given the Points of Interest already extracted from every file \
     in one directory. Identify relationships between POIs that only \
     become visible at directory scope (e.g. a class in one file extending \
     a class in a sibling file). Respond with the same JSON schema as \
     file-level analysis, omitting \"pois\"."
}

pub fn global_resolution_system_prompt() -> &'static str {
    "You are given a sampled pair of Points of Interest from different \
     directories, along with an unresolved reference name. Decide whether \
     a relationship plausibly exists between them at whole-repository \
     scope. Respond with the same JSON schema as file-level analysis, \
     omitting \"pois\", with at most one relationship and a conservative \
     confidence score."
}

/// Call the oracle and parse its response as [`OracleFindings`], retrying
/// with a corrective follow-up prompt exactly once if the first response
/// fails schema validation (spec §4.4). Shared by C4, C5, and C6.
pub async fn call_with_reparse(
    oracle: &OracleClient,
    worker: &str,
    system: &str,
    user: &str,
) -> anyhow::Result<OracleFindings> {
    let started = Instant::now();
    crate::metrics::oracle_call_started(worker);
    let response = oracle
        .call(OracleRequest {
            system: system.to_string(),
            user: user.to_string(),
        })
        .await;
    crate::metrics::oracle_call_finished(worker);
    crate::metrics::observe_oracle_call(worker, started.elapsed().as_secs_f64());
    let response = response?;

    match parse_findings(&response.body) {
        Ok(f) => Ok(f),
        Err(e) => {
            tracing::warn!(error = %e, worker, "oracle response failed schema validation, reparsing once");
            let retry_user = format!(
                "{user}\n\nYour previous response did not match the required JSON schema \
                 ({e}). Respond again with ONLY valid JSON matching the schema."
            );
            let retry = oracle
                .call(OracleRequest {
                    system: system.to_string(),
                    user: retry_user,
                })
                .await?;
            Ok(parse_findings(&retry.body)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_findings_plain_json() {
        let body = r#"{"pois": [{"file_path": "src/main.rs", "kind": "function", "name": "main", "start_line": 1, "end_line": 3}], "relationships": []}"#;
        let findings = parse_findings(body).unwrap();
        assert_eq!(findings.pois.len(), 1);
        assert_eq!(findings.pois[0].name, "main");
    }

    #[test]
    fn test_parse_findings_strips_code_fence() {
        let body = "```json\n{\"pois\": [], \"relationships\": []}\n```";
        let findings = parse_findings(body).unwrap();
        assert!(findings.pois.is_empty());
    }

    #[test]
    fn test_parse_findings_rejects_garbage() {
        assert!(parse_findings("not json").is_err());
    }
}
