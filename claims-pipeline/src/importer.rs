//! Claim ingest: the flat-file loader and the registry reconciliation
//! engine.
//!
//! The engine is the only writer of `#full-import` markers and the only
//! reader of the polling checkpoint. Reconciliation is a pure diff
//! between the registry's current works list and the log's state since
//! the last marker; the log itself is never rewritten.

use crate::bus::BusClient;
use crate::error::{PipelineError, Result};
use crate::models::{ClaimLogEntry, ClaimMessage, ClaimStatus};
use crate::registry::{extract_work_claim, extract_works, profile_last_modified, UpdatesSource};
use crate::store::{format_timestamp, parse_timestamp, Checkpoint, ClaimsLog};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Cursor value used before the first successful poll. Predates every
/// registry record, so the first cycle imports everything.
const CHECKPOINT_SENTINEL: &str = "1974-11-09T22:56:52.518001Z";

/// Flat-file batches commit in chunks of this many entries.
const IMPORT_BATCH: usize = 1000;

pub fn create_claim(
    identity_id: &str,
    document_id: &str,
    status: ClaimStatus,
    provenance: &str,
    created: DateTime<Utc>,
) -> ClaimLogEntry {
    ClaimLogEntry {
        id: 0,
        identity_id: identity_id.to_string(),
        document_id: document_id.to_string(),
        status,
        provenance: provenance.to_string(),
        created,
    }
}

/// Load a tab-delimited claims file: `document_id <TAB> identity_id
/// [<TAB> provenance [<TAB> status [<TAB> created]]]`, one claim per
/// line, `#` comments and blank lines skipped. Bad lines are logged and
/// skipped; the rest of the file still loads. Returns the inserted
/// entries.
pub fn import_flat_file(
    log: &ClaimsLog,
    path: &Path,
    default_provenance: &str,
    default_status: ClaimStatus,
) -> Result<Vec<ClaimLogEntry>> {
    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(file);
    let mut batch = Vec::new();
    let mut inserted = Vec::new();
    let now = Utc::now();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let mut fields = trimmed.split('\t').map(str::trim);
        let document_id = fields.next().unwrap_or_default();
        let identity_id = fields.next().unwrap_or_default();
        if document_id.is_empty() || identity_id.is_empty() {
            warn!(line = lineno + 1, "skipping malformed claims line");
            continue;
        }
        let provenance = match fields.next() {
            None | Some("") => default_provenance,
            Some(p) => p,
        };
        let status = match fields.next() {
            None | Some("") => default_status,
            Some(raw) => match ClaimStatus::parse(raw) {
                Ok(status) => status,
                Err(_) => {
                    warn!(line = lineno + 1, status = raw, "skipping unknown status");
                    continue;
                }
            },
        };
        let created = match fields.next() {
            None | Some("") => now,
            Some(raw) => match parse_timestamp(raw, "created") {
                Ok(created) => created,
                Err(_) => {
                    warn!(line = lineno + 1, created = raw, "skipping bad timestamp");
                    continue;
                }
            },
        };
        batch.push(create_claim(identity_id, document_id, status, provenance, created));
        if batch.len() >= IMPORT_BATCH {
            inserted.extend(log.insert_batch(std::mem::take(&mut batch))?);
        }
    }
    if !batch.is_empty() {
        inserted.extend(log.insert_batch(batch)?);
    }
    info!(claims = inserted.len(), file = %path.display(), "flat file imported");
    Ok(inserted)
}

#[derive(Clone)]
pub struct ReconciliationEngine {
    log: ClaimsLog,
    checkpoint: Checkpoint,
    source: Arc<dyn UpdatesSource>,
    bus: BusClient,
    poll_interval: Duration,
    update_window: chrono::Duration,
    provenance: String,
}

impl ReconciliationEngine {
    pub fn new(
        log: ClaimsLog,
        checkpoint: Checkpoint,
        source: Arc<dyn UpdatesSource>,
        bus: BusClient,
        poll_interval: Duration,
        update_window_secs: i64,
        provenance: &str,
    ) -> ReconciliationEngine {
        ReconciliationEngine {
            log,
            checkpoint,
            source,
            bus,
            poll_interval,
            update_window: chrono::Duration::seconds(update_window_secs),
            provenance: provenance.to_string(),
        }
    }

    /// One polling cycle. Returns how many log entries the cycle
    /// inserted; zero when the poll is not yet due or the feed is
    /// drained.
    pub fn check_registry_updates(&self) -> Result<usize> {
        let last_check = match self.checkpoint.get(Checkpoint::LAST_CHECK)? {
            Some(raw) => parse_timestamp(&raw, Checkpoint::LAST_CHECK)?,
            None => parse_timestamp(CHECKPOINT_SENTINEL, Checkpoint::LAST_CHECK)?,
        };
        let interval = chrono::Duration::from_std(self.poll_interval)
            .unwrap_or_else(|_| chrono::Duration::seconds(0));
        if last_check + interval > Utc::now() {
            return Ok(0);
        }

        let since = last_check + chrono::Duration::microseconds(1);
        let updates = self.source.fetch_updates(&since)?;
        if updates.is_empty() {
            return Ok(0);
        }
        let high_water = updates
            .iter()
            .map(|u| u.updated)
            .max()
            .unwrap_or(last_check);
        // The cursor moves first: a crash mid-batch skips the batch
        // rather than re-importing it forever.
        self.checkpoint
            .put(Checkpoint::LAST_CHECK, &format_timestamp(&high_water))?;
        info!(
            updates = updates.len(),
            since = %format_timestamp(&since),
            "processing registry updates"
        );

        let mut staged = Vec::new();
        for update in &updates {
            match self.stage_profile(&update.identity_id, update.profile.as_ref()) {
                Ok(entries) => staged.extend(entries),
                Err(e) if e.is_unit_local() => {
                    warn!(identity = update.identity_id.as_str(), error = %e, "skipping profile");
                }
                Err(e) => return Err(e),
            }
        }
        let inserted = self.log.insert_batch(staged)?;
        for entry in &inserted {
            if entry.status.is_terminal() {
                continue;
            }
            self.bus.publish(&ClaimMessage::from(entry), None)?;
        }
        Ok(inserted.len())
    }

    /// Diff one profile against the log. Everything staged here lands in
    /// one batch: the `#full-import` marker first, then the per-document
    /// outcomes.
    fn stage_profile(
        &self,
        identity_id: &str,
        profile: Option<&serde_json::Value>,
    ) -> Result<Vec<ClaimLogEntry>> {
        let profile = profile
            .ok_or_else(|| PipelineError::malformed("profile", "update without a profile"))?;
        // a profile without a usable history section still reconciles,
        // anchored at the current instant
        let last_modified = profile_last_modified(profile).unwrap_or_else(|_| Utc::now());

        let marker = self.log.latest_full_import(identity_id)?;
        if let Some(marker) = &marker {
            if marker.created == last_modified {
                debug!(identity = identity_id, "profile unchanged since last import");
                return Ok(Vec::new());
            }
        }

        // Registry side: current works list, keyed case-insensitively.
        // Duplicate identifiers within one profile resolve last-wins. A
        // malformed work entry is skipped; the rest of the profile still
        // reconciles.
        let mut registry: BTreeMap<String, crate::registry::WorkClaim> = BTreeMap::new();
        for work in extract_works(profile)? {
            match extract_work_claim(work) {
                Ok(Some(claim)) => {
                    registry.insert(claim.document_id.to_lowercase(), claim);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(identity = identity_id, error = %e, "skipping malformed work entry");
                }
            }
        }

        // Our side: fold the log since the marker into live and removed
        // sets. A later entry for the same document evicts the earlier
        // one from the opposite set. `unchanged` rows are audit records
        // and take no part in the fold.
        let mut have_active: BTreeMap<String, ClaimLogEntry> = BTreeMap::new();
        let mut have_removed: BTreeMap<String, ClaimLogEntry> = BTreeMap::new();
        for entry in self.log.entries_for(identity_id, marker.map(|m| m.id))? {
            let key = entry.document_id.to_lowercase();
            match entry.status {
                ClaimStatus::Claimed | ClaimStatus::Updated => {
                    have_removed.remove(&key);
                    have_active.insert(key, entry);
                }
                ClaimStatus::Removed => {
                    have_active.remove(&key);
                    have_removed.insert(key, entry);
                }
                ClaimStatus::Unchanged | ClaimStatus::FullImport => {}
            }
        }

        let mut staged = vec![create_claim(
            identity_id,
            "",
            ClaimStatus::FullImport,
            &self.provenance,
            last_modified,
        )];
        for (key, work) in &registry {
            let status = match have_active.get(key) {
                Some(existing) if work.updated > existing.created + self.update_window => {
                    ClaimStatus::Updated
                }
                Some(_) => ClaimStatus::Unchanged,
                None => ClaimStatus::Claimed,
            };
            staged.push(create_claim(
                identity_id,
                &work.document_id,
                status,
                &work.provenance,
                work.updated,
            ));
        }
        for (key, existing) in &have_active {
            if !registry.contains_key(key) {
                staged.push(create_claim(
                    identity_id,
                    &existing.document_id,
                    ClaimStatus::Removed,
                    &self.provenance,
                    Utc::now(),
                ));
            }
        }
        Ok(staged)
    }

    /// Background polling thread: drain the feed to quiescence, then
    /// sleep half the poll interval, until the stop flag is set.
    pub fn spawn(&self, stop: Arc<AtomicBool>) -> Result<JoinHandle<()>> {
        let engine = self.clone();
        std::thread::Builder::new()
            .name("reconciliation".to_string())
            .spawn(move || {
                std::thread::sleep(Duration::from_secs(1));
                while !stop.load(Ordering::Relaxed) {
                    loop {
                        match engine.check_registry_updates() {
                            Ok(0) => break,
                            Ok(n) => debug!(entries = n, "cycle complete"),
                            Err(e) => {
                                error!(error = %e, "reconciliation cycle failed");
                                break;
                            }
                        }
                    }
                    engine.sleep_interruptibly(&stop);
                }
            })
            .map_err(|e| PipelineError::Connection(format!("spawn failed: {}", e)))
    }

    fn sleep_interruptibly(&self, stop: &AtomicBool) {
        let nap = (self.poll_interval / 2).max(Duration::from_millis(200));
        let step = Duration::from_millis(200);
        let deadline = std::time::Instant::now() + nap;
        while std::time::Instant::now() < deadline && !stop.load(Ordering::Relaxed) {
            std::thread::sleep(step);
        }
    }
}
