//! Persistent identity records (the author knowledge base).

use super::{format_timestamp, parse_timestamp, Db};
use crate::error::Result;
use crate::models::{AccountStatus, IdentityRecord};
use rusqlite::{params, OptionalExtension};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct IdentityStore {
    db: Db,
}

type IdentityRow = (
    i64,
    String,
    String,
    String,
    String,
    Option<i64>,
    String,
    String,
);

impl IdentityStore {
    pub fn new(db: Db) -> IdentityStore {
        IdentityStore { db }
    }

    pub fn find(&self, identity_id: &str) -> Result<Option<IdentityRecord>> {
        let conn = self.db.lock()?;
        let row: Option<IdentityRow> = conn
            .prepare(
                "SELECT id, identity_id, display_name, name_variants, account_status, \
                 linked_account_id, created, updated FROM authors WHERE identity_id = ?1",
            )?
            .query_row(params![identity_id], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                ))
            })
            .optional()?;
        row.map(Self::decode).transpose()
    }

    /// Insert a freshly harvested record and return it with its assigned
    /// id.
    pub fn insert(&self, mut record: IdentityRecord) -> Result<IdentityRecord> {
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO authors(identity_id, display_name, name_variants, account_status, \
             linked_account_id, created, updated) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.identity_id,
                record.display_name,
                serde_json::to_string(&record.name_variants)?,
                serde_json::to_value(record.account_status)?
                    .as_str()
                    .unwrap_or("unknown")
                    .to_string(),
                record.linked_account_id,
                format_timestamp(&record.created),
                format_timestamp(&record.updated),
            ],
        )?;
        record.id = conn.last_insert_rowid();
        Ok(record)
    }

    fn decode(
        (id, identity_id, display_name, variants, status, linked_account_id, created, updated): IdentityRow,
    ) -> Result<IdentityRecord> {
        let name_variants: BTreeMap<String, Vec<String>> =
            serde_json::from_str(&variants).unwrap_or_default();
        let account_status: AccountStatus =
            serde_json::from_value(serde_json::Value::String(status))
                .unwrap_or(AccountStatus::Unknown);
        Ok(IdentityRecord {
            id,
            identity_id,
            display_name,
            name_variants,
            account_status,
            linked_account_id,
            created: parse_timestamp(&created, "authors.created")?,
            updated: parse_timestamp(&updated, "authors.updated")?,
        })
    }
}
