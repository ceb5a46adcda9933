//! Identity directory: who is behind a registry identity id.
//!
//! Lookups go memory cache, then sqlite, then a harvest against the
//! public registry and the institution's search index. Harvested records
//! are persisted so the network is hit at most once per identity.

use crate::error::Result;
use crate::models::{AccountStatus, IdentityRecord};
use crate::registry::{dig, RegistryClient};
use crate::store::IdentityStore;
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// The two registry lookups the harvest needs, kept behind a trait so the
/// directory can be exercised without the network.
pub trait ProfileLookup: Send + Sync {
    fn public_profile(&self, identity_id: &str) -> Result<Option<Value>>;
    fn search_documents(&self, identity_id: &str) -> Result<Vec<Value>>;
}

impl ProfileLookup for RegistryClient {
    fn public_profile(&self, identity_id: &str) -> Result<Option<Value>> {
        RegistryClient::public_profile(self, identity_id)
    }
    fn search_documents(&self, identity_id: &str) -> Result<Vec<Value>> {
        RegistryClient::search_documents(self, identity_id)
    }
}

struct CacheEntry {
    record: IdentityRecord,
    created_at: Instant,
}

pub struct IdentityDirectory {
    store: IdentityStore,
    lookup: Arc<dyn ProfileLookup>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    capacity: usize,
    ttl: Duration,
}

impl IdentityDirectory {
    pub fn new(
        store: IdentityStore,
        lookup: Arc<dyn ProfileLookup>,
        capacity: usize,
        ttl: Duration,
    ) -> IdentityDirectory {
        IdentityDirectory {
            store,
            lookup,
            cache: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            ttl,
        }
    }

    pub fn retrieve(&self, identity_id: &str) -> Result<IdentityRecord> {
        if let Some(record) = self.cached(identity_id) {
            return Ok(record);
        }
        let record = match self.store.find(identity_id)? {
            Some(record) => record,
            None => {
                info!(identity = identity_id, "unknown identity, harvesting");
                let record = self.harvest(identity_id)?;
                self.store.insert(record)?
            }
        };
        self.remember(record.clone());
        Ok(record)
    }

    fn cached(&self, identity_id: &str) -> Option<IdentityRecord> {
        let cache = self.cache.lock().ok()?;
        let entry = cache.get(identity_id)?;
        if entry.created_at.elapsed() >= self.ttl {
            return None;
        }
        Some(entry.record.clone())
    }

    fn remember(&self, record: IdentityRecord) {
        let Ok(mut cache) = self.cache.lock() else {
            return;
        };
        let ttl = self.ttl;
        cache.retain(|_, entry| entry.created_at.elapsed() < ttl);
        if cache.len() >= self.capacity {
            if let Some(oldest) = cache
                .iter()
                .min_by_key(|(_, entry)| entry.created_at)
                .map(|(key, _)| key.clone())
            {
                cache.remove(&oldest);
            }
        }
        cache.insert(
            record.identity_id.clone(),
            CacheEntry {
                record,
                created_at: Instant::now(),
            },
        );
    }

    /// Build a record from the public registry bio and the documents in
    /// our own index that claim the identity.
    fn harvest(&self, identity_id: &str) -> Result<IdentityRecord> {
        let mut variants: BTreeMap<String, Vec<String>> = BTreeMap::new();

        if let Some(bio) = self.lookup.public_profile(identity_id)? {
            if let Some(name) = registry_name(&bio) {
                variants.insert("registry_name".to_string(), vec![name]);
            }
        }

        // spellings with duplicates, for the frequency election below
        let mut spellings = Vec::new();
        for doc in self.lookup.search_documents(identity_id)? {
            match harvest_document(identity_id, &doc) {
                Some((author, author_norm)) => {
                    if let Some(name) = author {
                        spellings.push(name.clone());
                        push_unique(variants.entry("author".to_string()).or_default(), name);
                    }
                    if let Some(name) = author_norm {
                        push_unique(variants.entry("author_norm".to_string()).or_default(), name);
                    }
                }
                None => {
                    warn!(identity = identity_id, "skipping malformed search document");
                }
            }
        }

        let display_name = elect_display_name(&spellings, &variants)
            .unwrap_or_else(|| identity_id.to_string());
        debug!(identity = identity_id, display = display_name.as_str(), "harvested");
        let now = Utc::now();
        Ok(IdentityRecord {
            id: 0,
            identity_id: identity_id.to_string(),
            display_name,
            name_variants: variants,
            account_status: AccountStatus::Unknown,
            linked_account_id: None,
            created: now,
            updated: now,
        })
    }
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !list.iter().any(|v| v == &value) {
        list.push(value);
    }
}

/// "Family, Given" from the bio's personal details.
fn registry_name(bio: &Value) -> Option<String> {
    let details = dig(
        bio,
        &["orcid-profile", "orcid-bio", "personal-details"],
    )
    .ok()?;
    let family = details
        .get("family-name")
        .and_then(|v| v.get("value"))
        .and_then(|v| v.as_str())?;
    let given = details
        .get("given-names")
        .and_then(|v| v.get("value"))
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    if given.is_empty() {
        Some(family.to_string())
    } else {
        Some(format!("{}, {}", family, given))
    }
}

/// The author name strings this identity uses on one of our documents.
/// The claimed position is where the cleaned identity id sits in the
/// document's public-claims column.
fn harvest_document(identity_id: &str, doc: &Value) -> Option<(Option<String>, Option<String>)> {
    let cleaned: String = identity_id
        .chars()
        .filter(|c| *c != '-')
        .collect::<String>()
        .to_lowercase();
    let claims = doc.get("identity_pub")?.as_array()?;
    let position = claims.iter().position(|entry| {
        entry
            .as_str()
            .map(|s| {
                let entry_cleaned: String =
                    s.chars().filter(|c| *c != '-').collect::<String>().to_lowercase();
                entry_cleaned == cleaned
            })
            .unwrap_or(false)
    })?;
    let pick = |key: &str| {
        doc.get(key)
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.get(position))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    Some((pick("author"), pick("author_norm")))
}

/// Most frequent author spelling wins, ties resolved lexicographically;
/// the registry's own name is the fallback.
fn elect_display_name(
    spellings: &[String],
    variants: &BTreeMap<String, Vec<String>>,
) -> Option<String> {
    if !spellings.is_empty() {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for name in spellings {
            *counts.entry(name.as_str()).or_default() += 1;
        }
        return counts
            .into_iter()
            .max_by_key(|(_, count)| *count)
            .map(|(name, _)| name.to_string());
    }
    variants
        .get("registry_name")
        .and_then(|v| v.first())
        .cloned()
}
