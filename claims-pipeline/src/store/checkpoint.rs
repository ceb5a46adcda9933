//! Single key -> value map; the reconciliation engine's polling cursor
//! lives here under [`Checkpoint::LAST_CHECK`].

use super::Db;
use crate::error::Result;
use rusqlite::{params, OptionalExtension};

#[derive(Debug, Clone)]
pub struct Checkpoint {
    db: Db,
}

impl Checkpoint {
    /// The one coordination point for incremental polling.
    pub const LAST_CHECK: &'static str = "last.check";

    pub fn new(db: Db) -> Checkpoint {
        Checkpoint { db }
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.db.lock()?;
        let value = conn
            .prepare("SELECT value FROM storage WHERE key = ?1")?
            .query_row(params![key], |row| row.get::<_, String>(0))
            .optional()?;
        Ok(value)
    }

    pub fn put(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO storage(key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_put_overwrite() {
        let kv = Checkpoint::new(Db::open_in_memory().unwrap());
        assert_eq!(kv.get(Checkpoint::LAST_CHECK).unwrap(), None);
        kv.put(Checkpoint::LAST_CHECK, "2026-01-01T00:00:00Z").unwrap();
        kv.put(Checkpoint::LAST_CHECK, "2026-02-01T00:00:00Z").unwrap();
        assert_eq!(
            kv.get(Checkpoint::LAST_CHECK).unwrap().as_deref(),
            Some("2026-02-01T00:00:00Z")
        );
    }
}
