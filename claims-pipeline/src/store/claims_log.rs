//! The append-only claims log.

use super::{format_timestamp, parse_timestamp, Db};
use crate::error::Result;
use crate::models::{ClaimLogEntry, ClaimStatus};
use rusqlite::{params, OptionalExtension, Row};

#[derive(Debug, Clone)]
pub struct ClaimsLog {
    db: Db,
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<(i64, String, String, String, String, String)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

impl ClaimsLog {
    pub fn new(db: Db) -> ClaimsLog {
        ClaimsLog { db }
    }

    /// Insert a batch of entries in one transaction and return them with
    /// their store-assigned ids, in insertion order.
    pub fn insert_batch(&self, entries: Vec<ClaimLogEntry>) -> Result<Vec<ClaimLogEntry>> {
        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;
        let mut inserted = Vec::with_capacity(entries.len());
        for mut entry in entries {
            tx.execute(
                "INSERT INTO claims(identity_id, document_id, status, provenance, created) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    entry.identity_id,
                    entry.document_id,
                    entry.status.as_str(),
                    entry.provenance,
                    format_timestamp(&entry.created),
                ],
            )?;
            entry.id = tx.last_insert_rowid();
            inserted.push(entry);
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Most recent `#full-import` marker for an identity, if any.
    pub fn latest_full_import(&self, identity_id: &str) -> Result<Option<ClaimLogEntry>> {
        let conn = self.db.lock()?;
        let row = conn
            .prepare(
                "SELECT id, identity_id, document_id, status, provenance, created \
                 FROM claims WHERE identity_id = ?1 AND status = ?2 \
                 ORDER BY id DESC LIMIT 1",
            )?
            .query_row(
                params![identity_id, ClaimStatus::FullImport.as_str()],
                entry_from_row,
            )
            .optional()?;
        row.map(Self::decode).transpose()
    }

    /// All entries for an identity in causal (`id` ascending) order,
    /// optionally restricted to entries after a marker id.
    pub fn entries_for(
        &self,
        identity_id: &str,
        after_id: Option<i64>,
    ) -> Result<Vec<ClaimLogEntry>> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, identity_id, document_id, status, provenance, created \
             FROM claims WHERE identity_id = ?1 AND id > ?2 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![identity_id, after_id.unwrap_or(0)], entry_from_row)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(Self::decode(row?)?);
        }
        Ok(entries)
    }

    /// Every entry in the log, insertion order. Audit/test helper.
    pub fn all(&self) -> Result<Vec<ClaimLogEntry>> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, identity_id, document_id, status, provenance, created \
             FROM claims ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], entry_from_row)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(Self::decode(row?)?);
        }
        Ok(entries)
    }

    fn decode(
        (id, identity_id, document_id, status, provenance, created): (
            i64,
            String,
            String,
            String,
            String,
            String,
        ),
    ) -> Result<ClaimLogEntry> {
        Ok(ClaimLogEntry {
            id,
            identity_id,
            document_id,
            status: ClaimStatus::parse(&status)?,
            provenance,
            created: parse_timestamp(&created, "claims.created")?,
        })
    }
}
