//! Bookkeeping of merged claims per document. Written after the merge
//! result went back onto the pipeline; `processed` marks downstream
//! consumption.

use super::{format_timestamp, Db};
use crate::error::{PipelineError, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};

#[derive(Debug, Clone)]
pub struct RecordsStore {
    db: Db,
}

impl RecordsStore {
    pub fn new(db: Db) -> RecordsStore {
        RecordsStore { db }
    }

    /// Upsert the merged claims JSON for a document.
    pub fn record_claims(&self, document_id: &str, claims: &serde_json::Value) -> Result<()> {
        let now = format_timestamp(&Utc::now());
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO records(document_id, claims, created, updated) VALUES (?1, ?2, ?3, ?3) \
             ON CONFLICT(document_id) DO UPDATE SET \
             claims = excluded.claims, updated = excluded.updated",
            params![document_id, serde_json::to_string(claims)?, now],
        )?;
        Ok(())
    }

    pub fn claims(&self, document_id: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.db.lock()?;
        let raw: Option<String> = conn
            .prepare("SELECT claims FROM records WHERE document_id = ?1")?
            .query_row(params![document_id], |row| row.get(0))
            .optional()?;
        raw.map(|s| serde_json::from_str(&s).map_err(Into::into))
            .transpose()
    }

    /// Stamp the moment something downstream consumed the record. Errors
    /// on a nonexistent record.
    pub fn mark_processed(&self, document_id: &str) -> Result<()> {
        let now = format_timestamp(&Utc::now());
        let conn = self.db.lock()?;
        let changed = conn.execute(
            "UPDATE records SET processed = ?2 WHERE document_id = ?1",
            params![document_id, now],
        )?;
        if changed == 0 {
            return Err(PipelineError::Store(format!(
                "no record to mark processed for {}",
                document_id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_claims_upsert_and_mark_processed() {
        let records = RecordsStore::new(Db::open_in_memory().unwrap());
        assert!(records.mark_processed("doc").is_err());

        records
            .record_claims("doc", &json!({"verified": ["-"], "unverified": ["0000-0001"]}))
            .unwrap();
        records
            .record_claims("doc", &json!({"verified": ["0000-0001"], "unverified": ["-"]}))
            .unwrap();
        let claims = records.claims("doc").unwrap().unwrap();
        assert_eq!(claims["verified"][0], "0000-0001");

        records.mark_processed("doc").unwrap();
    }
}
