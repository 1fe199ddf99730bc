//! Backlog document (`prd.json`) loading with schema + invariant validation.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::Draft;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use crate::core::invariants::validate_backlog;
use crate::core::types::{Backlog, Story};

/// Embedded JSON Schema (Draft 2020-12) for backlog documents.
pub const BACKLOG_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../schemas/backlog/v1.schema.json"
));

/// The backlog document as authored by the story-selection source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacklogDocument {
    pub branch_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub user_stories: Vec<Story>,
}

impl BacklogDocument {
    /// The run-owned copy of the story list.
    pub fn to_backlog(&self) -> Backlog {
        Backlog::new(self.user_stories.clone())
    }
}

/// Where a run's backlog comes from.
#[derive(Debug, Clone)]
pub enum BacklogRef {
    /// A `prd.json` file on disk; its path is the source id.
    Path(PathBuf),
    /// A document supplied by the caller with an explicit source id.
    Inline { source_id: String, document: Value },
}

/// A validated backlog together with its provenance.
#[derive(Debug, Clone)]
pub struct LoadedBacklog {
    pub source_id: String,
    /// Hex SHA-256 of the document bytes.
    pub digest: String,
    pub document: BacklogDocument,
}

/// Resolve, parse and validate a backlog reference.
#[instrument(skip_all)]
pub fn load_backlog(reference: &BacklogRef) -> Result<LoadedBacklog> {
    let (source_id, raw) = match reference {
        BacklogRef::Path(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("read backlog {}", path.display()))?;
            let source_id = path
                .canonicalize()
                .unwrap_or_else(|_| path.clone())
                .display()
                .to_string();
            (source_id, raw)
        }
        BacklogRef::Inline {
            source_id,
            document,
        } => {
            if source_id.trim().is_empty() {
                bail!("sourceId must not be blank for an inline backlog");
            }
            let raw = serde_json::to_string(document).context("serialize inline backlog")?;
            (source_id.clone(), raw)
        }
    };
    let document =
        parse_backlog(&raw).with_context(|| format!("invalid backlog '{source_id}'"))?;
    let digest = digest_hex(raw.as_bytes());
    debug!(
        source_id = %source_id,
        stories = document.user_stories.len(),
        digest = %digest,
        "loaded backlog"
    );
    Ok(LoadedBacklog {
        source_id,
        digest,
        document,
    })
}

/// Parse a raw backlog document, validating schema and invariants.
pub fn parse_backlog(raw: &str) -> Result<BacklogDocument> {
    let value: Value = serde_json::from_str(raw).context("parse backlog json")?;
    validate_schema(&value)?;
    let document: BacklogDocument =
        serde_json::from_value(value).context("deserialize backlog")?;
    let errors = validate_backlog(&document.branch_name, &document.to_backlog());
    if !errors.is_empty() {
        bail!("invariant violations:\n- {}", errors.join("\n- "));
    }
    Ok(document)
}

fn validate_schema(instance: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(BACKLOG_SCHEMA).context("parse backlog schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .map_err(|err| anyhow!("compile backlog schema: {err}"))?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}

fn digest_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const VALID: &str = r#"{
        "branchName": "feature/catalog",
        "project": "shop",
        "userStories": [
            {"id": "US-1", "title": "List products", "acceptanceCriteria": ["shows a list"], "priority": 2, "passes": false},
            {"id": "US-2", "epic": "Catalog", "title": "Product model", "acceptanceCriteria": [], "priority": 1, "passes": false}
        ]
    }"#;

    #[test]
    fn parses_valid_document() {
        let doc = parse_backlog(VALID).expect("parse");
        assert_eq!(doc.branch_name, "feature/catalog");
        assert_eq!(doc.user_stories.len(), 2);
        assert_eq!(doc.user_stories[1].epic_label(), "Catalog");
        assert_eq!(doc.user_stories[0].epic_label(), "ungrouped");
    }

    #[test]
    fn rejects_schema_violation() {
        let err = parse_backlog(r#"{"branchName": "x", "userStories": [{"id": "a"}]}"#)
            .unwrap_err();
        assert!(format!("{err:#}").contains("schema validation failed"));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let raw = json!({
            "branchName": "x",
            "userStories": [{"id": "a", "title": "A"}, {"id": "a", "title": "B"}]
        })
        .to_string();
        let err = parse_backlog(&raw).unwrap_err();
        assert!(format!("{err:#}").contains("duplicate story id 'a'"));
    }

    #[test]
    fn load_from_path_records_digest() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("prd.json");
        fs::write(&path, VALID).expect("write");

        let loaded = load_backlog(&BacklogRef::Path(path.clone())).expect("load");
        assert_eq!(loaded.digest, digest_hex(VALID.as_bytes()));
        assert_eq!(loaded.digest.len(), 64);
        assert!(loaded.source_id.ends_with("prd.json"));
    }

    #[test]
    fn inline_requires_source_id() {
        let document: Value = serde_json::from_str(VALID).expect("json");
        let err = load_backlog(&BacklogRef::Inline {
            source_id: " ".to_string(),
            document: document.clone(),
        })
        .unwrap_err();
        assert!(err.to_string().contains("sourceId"));

        let loaded = load_backlog(&BacklogRef::Inline {
            source_id: "prd-7".to_string(),
            document,
        })
        .expect("load inline");
        assert_eq!(loaded.source_id, "prd-7");
    }
}
