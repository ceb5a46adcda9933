//! HTTP access to the claims registry and the institution's search
//! index, plus the helpers that dig the registry's deeply nested profile
//! JSON.

use crate::error::{PipelineError, Result};
use crate::store::{format_timestamp, parse_timestamp};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// One identity whose profile changed since the last poll.
#[derive(Debug, Clone)]
pub struct RegistryUpdate {
    pub identity_id: String,
    /// Full profile as delivered by the feed; absent when the feed only
    /// announced the change.
    pub profile: Option<Value>,
    pub updated: DateTime<Utc>,
}

/// One work entry extracted from a profile.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkClaim {
    pub document_id: String,
    pub updated: DateTime<Utc>,
    pub provenance: String,
}

/// Feed of registry updates, abstracted so the reconciliation engine can
/// be driven without the network.
pub trait UpdatesSource: Send + Sync {
    fn fetch_updates(&self, since: &DateTime<Utc>) -> Result<Vec<RegistryUpdate>>;
}

pub struct RegistryClient {
    http: reqwest::blocking::Client,
    updates_endpoint: String,
    public_profile_endpoint: String,
    search_endpoint: String,
    token: String,
}

impl RegistryClient {
    pub fn new(api: &crate::config::ApiConfig) -> Result<RegistryClient> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(RegistryClient {
            http,
            updates_endpoint: api.updates_endpoint.clone(),
            public_profile_endpoint: api.public_profile_endpoint.clone(),
            search_endpoint: api.search_endpoint.clone(),
            token: api.token.clone(),
        })
    }

    /// Public registry bio for one identity, `None` when the registry has
    /// nothing for it.
    pub fn public_profile(&self, identity_id: &str) -> Result<Option<Value>> {
        let url = self.public_profile_endpoint.replace("{id}", identity_id);
        debug!(%url, "fetching public profile");
        let response = self
            .http
            .get(&url)
            .header("Accept", "application/json")
            .send()?;
        if !response.status().is_success() {
            return Ok(None);
        }
        Ok(Some(response.json()?))
    }

    /// Documents in the institution's index claiming this identity.
    /// Returns the raw response docs.
    pub fn search_documents(&self, identity_id: &str) -> Result<Vec<Value>> {
        let cleaned: String = identity_id
            .chars()
            .filter(|c| *c != '-')
            .collect::<String>()
            .to_lowercase();
        debug!(identity = identity_id, "searching claimed documents");
        let response = self
            .http
            .get(&self.search_endpoint)
            .bearer_auth(&self.token)
            .query(&[
                ("q", format!("identity_pub:{}", cleaned).as_str()),
                ("fl", "author,author_norm,identity_pub"),
                ("rows", "100"),
            ])
            .send()?;
        if !response.status().is_success() {
            return Err(PipelineError::Connection(format!(
                "search returned {}",
                response.status()
            )));
        }
        let body: Value = response.json()?;
        let docs = body
            .get("response")
            .and_then(|r| r.get("docs"))
            .and_then(|d| d.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(docs)
    }
}

impl UpdatesSource for RegistryClient {
    fn fetch_updates(&self, since: &DateTime<Utc>) -> Result<Vec<RegistryUpdate>> {
        let url = self
            .updates_endpoint
            .replace("{since}", &format_timestamp(since));
        debug!(%url, "polling registry updates");
        let response = self.http.get(&url).bearer_auth(&self.token).send()?;
        if !response.status().is_success() {
            return Err(PipelineError::Connection(format!(
                "update feed returned {}",
                response.status()
            )));
        }
        let body = response.text()?;
        if body.trim().is_empty() {
            return Ok(Vec::new());
        }
        let value: Value = serde_json::from_str(&body)?;
        let Some(items) = value.as_array() else {
            return Err(PipelineError::malformed(
                "updates",
                "feed did not return an array",
            ));
        };
        items.iter().map(decode_update).collect()
    }
}

fn decode_update(item: &Value) -> Result<RegistryUpdate> {
    let identity_id = item
        .get("orcid_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| PipelineError::malformed("orcid_id", "missing identity id"))?
        .to_string();
    let updated = item
        .get("updated")
        .and_then(|v| v.as_str())
        .ok_or_else(|| PipelineError::malformed("updated", "missing timestamp"))?;
    Ok(RegistryUpdate {
        identity_id,
        profile: item.get("profile").filter(|p| !p.is_null()).cloned(),
        updated: parse_timestamp(updated, "updated")?,
    })
}

/// Walk a chain of object keys, failing with the joined path on the first
/// missing link.
pub fn dig<'a>(value: &'a Value, path: &[&str]) -> Result<&'a Value> {
    let mut current = value;
    for (i, key) in path.iter().enumerate() {
        current = current.get(key).ok_or_else(|| {
            PipelineError::malformed(path[..=i].join("/"), "missing profile element")
        })?;
    }
    Ok(current)
}

/// The work entries of a profile. A profile without a works section is
/// malformed; an empty list is legitimate (the owner removed everything).
pub fn extract_works(profile: &Value) -> Result<&Vec<Value>> {
    dig(
        profile,
        &["orcid-profile", "orcid-activities", "orcid-works", "orcid-work"],
    )?
    .as_array()
    .ok_or_else(|| PipelineError::malformed("orcid-work", "works section is not a list"))
}

/// Last-modified instant of the whole profile, from epoch milliseconds
/// that arrive either as a number or a digit string.
pub fn profile_last_modified(profile: &Value) -> Result<DateTime<Utc>> {
    let value = dig(
        profile,
        &["orcid-profile", "orcid-history", "last-modified-date", "value"],
    )?;
    let millis = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse::<i64>().ok(),
        _ => None,
    }
    .ok_or_else(|| PipelineError::malformed("last-modified-date/value", "not epoch millis"))?;
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| PipelineError::malformed("last-modified-date/value", "out of range"))
}

/// One work entry to a claim against our own corpus. Works without a
/// `bibcode` identifier are someone else's records and skipped, not
/// errors.
pub fn extract_work_claim(work: &Value) -> Result<Option<WorkClaim>> {
    let ids = dig(work, &["work-external-identifiers", "work-external-identifier"])?
        .as_array()
        .ok_or_else(|| {
            PipelineError::malformed("work-external-identifier", "identifiers are not a list")
        })?;
    let mut document_id = None;
    for id in ids {
        let id_type = id
            .get("work-external-identifier-type")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if !id_type.eq_ignore_ascii_case("bibcode") {
            continue;
        }
        document_id = dig(id, &["work-external-identifier-id", "value"])?
            .as_str()
            .map(|s| s.trim().to_string());
        break;
    }
    let Some(document_id) = document_id else {
        return Ok(None);
    };
    let millis_value = dig(work, &["last-modified-date", "value"])?;
    let millis = match millis_value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse::<i64>().ok(),
        _ => None,
    }
    .ok_or_else(|| PipelineError::malformed("last-modified-date/value", "not epoch millis"))?;
    let updated = Utc
        .timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| PipelineError::malformed("last-modified-date/value", "out of range"))?;
    let provenance = work
        .get("source")
        .and_then(|s| s.get("source-name"))
        .and_then(|n| n.get("value"))
        .and_then(|v| v.as_str())
        .unwrap_or("registry")
        .to_string();
    Ok(Some(WorkClaim {
        document_id,
        updated,
        provenance,
    }))
}
