//! Data model shared across the pipeline: claims-log entries, identity
//! records and the JSON envelopes travelling between stages.

use crate::error::{PipelineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Status of a claims-log entry.
///
/// `FullImport` is a reconciliation checkpoint boundary: an entry with an
/// empty document id recording "as of this instant, the registry's works
/// list was fully reconciled for this identity". `Unchanged` entries are
/// recorded for audit only; neither is ever published downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ClaimStatus {
    #[serde(rename = "claimed")]
    Claimed,
    #[serde(rename = "updated")]
    Updated,
    #[serde(rename = "removed")]
    Removed,
    #[serde(rename = "unchanged")]
    Unchanged,
    #[serde(rename = "#full-import")]
    FullImport,
}

impl ClaimStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimStatus::Claimed => "claimed",
            ClaimStatus::Updated => "updated",
            ClaimStatus::Removed => "removed",
            ClaimStatus::Unchanged => "unchanged",
            ClaimStatus::FullImport => "#full-import",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "claimed" => Ok(ClaimStatus::Claimed),
            "updated" => Ok(ClaimStatus::Updated),
            "removed" => Ok(ClaimStatus::Removed),
            "unchanged" => Ok(ClaimStatus::Unchanged),
            "#full-import" => Ok(ClaimStatus::FullImport),
            other => Err(PipelineError::malformed(
                "status",
                format!("unknown status {:?}", other),
            )),
        }
    }

    /// Terminal entries are bookkeeping only and never leave the log.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ClaimStatus::Unchanged | ClaimStatus::FullImport)
    }
}

/// One row of the append-only claims log. Immutable once written; `id`
/// order is the authoritative causal order per identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimLogEntry {
    /// Store-assigned, monotonic. Zero until inserted.
    #[serde(default)]
    pub id: i64,
    pub identity_id: String,
    /// Empty for `#full-import` markers.
    #[serde(default)]
    pub document_id: String,
    pub status: ClaimStatus,
    #[serde(default)]
    pub provenance: String,
    pub created: DateTime<Utc>,
}

/// Account standing of an identity on the institutional platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Blacklisted,
    Postponed,
    #[serde(other)]
    Unknown,
}

impl AccountStatus {
    /// Claims from these accounts are silently dropped by the enricher.
    pub fn is_short_circuited(&self) -> bool {
        matches!(self, AccountStatus::Blacklisted | AccountStatus::Postponed)
    }
}

/// Cached knowledge about one registry identity. Created lazily on first
/// encounter, possibly by querying the registry and the institution's own
/// search index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    #[serde(default)]
    pub id: i64,
    pub identity_id: String,
    pub display_name: String,
    /// Variant kind (`author`, `author_norm`, `registry_name`) to the
    /// ordered set of name strings collected for that kind.
    #[serde(default)]
    pub name_variants: BTreeMap<String, Vec<String>>,
    pub account_status: AccountStatus,
    pub linked_account_id: Option<i64>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// JSON envelope carried between stages.
///
/// Stages only ever add fields; `extra` keeps whatever upstream attached
/// so nothing is dropped on re-serialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClaimMessage {
    #[serde(default)]
    pub document_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ClaimStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ClaimMessage {
    pub fn identity_id(&self) -> Result<&str> {
        self.identity_id
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                PipelineError::UnknownPayload("message is missing identity_id".to_string())
            })
    }

    pub fn document_id(&self) -> Result<&str> {
        if self.document_id.is_empty() {
            return Err(PipelineError::UnknownPayload(
                "message is missing document_id".to_string(),
            ));
        }
        Ok(&self.document_id)
    }

    /// String list stored under an enrichment key, empty when absent.
    pub fn string_list(&self, key: &str) -> Vec<String> {
        self.extra
            .get(key)
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl From<&ClaimLogEntry> for ClaimMessage {
    fn from(entry: &ClaimLogEntry) -> Self {
        ClaimMessage {
            document_id: entry.document_id.clone(),
            identity_id: Some(entry.identity_id.clone()),
            id: Some(entry.id),
            provenance: Some(entry.provenance.clone()),
            status: Some(entry.status),
            created: Some(entry.created),
            extra: BTreeMap::new(),
        }
    }
}

/// Decoded stage input: the known message shapes per topic plus a
/// catch-all for anything else. The catch-all is what the worker-stage
/// wrapper turns into an `UnknownPayload` dead-letter.
#[derive(Debug, Clone)]
pub enum Payload {
    One(ClaimMessage),
    Many(Vec<ClaimMessage>),
    Unrecognized(serde_json::Value),
}

impl Payload {
    pub fn decode(raw: &[u8]) -> Result<Payload> {
        let value: serde_json::Value = serde_json::from_slice(raw)?;
        Ok(Payload::from_value(value))
    }

    pub fn from_value(value: serde_json::Value) -> Payload {
        match value {
            serde_json::Value::Object(_) => match ClaimMessage::deserialize(&value) {
                Ok(msg) => Payload::One(msg),
                Err(_) => Payload::Unrecognized(value),
            },
            serde_json::Value::Array(_) => match Vec::<ClaimMessage>::deserialize(&value) {
                Ok(msgs) => Payload::Many(msgs),
                Err(_) => Payload::Unrecognized(value),
            },
            other => Payload::Unrecognized(other),
        }
    }

    /// Expect a single message, as consumed from the claims/updates/output
    /// topics.
    pub fn into_one(self) -> Result<ClaimMessage> {
        match self {
            Payload::One(msg) => Ok(msg),
            other => Err(PipelineError::UnknownPayload(format!(
                "expected a single message object, got {:?}",
                other
            ))),
        }
    }

    /// Expect one or many messages, as consumed from the fresh-claims
    /// topic.
    pub fn into_many(self) -> Result<Vec<ClaimMessage>> {
        match self {
            Payload::One(msg) => Ok(vec![msg]),
            Payload::Many(msgs) => Ok(msgs),
            Payload::Unrecognized(v) => Err(PipelineError::UnknownPayload(v.to_string())),
        }
    }
}
