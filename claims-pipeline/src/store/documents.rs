//! Canonical author lists per document, mirrored from the institutional
//! publication database. The merge stage reads these; imports and
//! fixtures write them.

use super::Db;
use crate::error::Result;
use rusqlite::{params, OptionalExtension};

#[derive(Debug, Clone)]
pub struct DocumentStore {
    db: Db,
}

impl DocumentStore {
    pub fn new(db: Db) -> DocumentStore {
        DocumentStore { db }
    }

    pub fn put(&self, document_id: &str, authors: &[String], author_norm: Option<&[String]>) -> Result<()> {
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO documents(document_id, authors, author_norm) VALUES (?1, ?2, ?3) \
             ON CONFLICT(document_id) DO UPDATE SET \
             authors = excluded.authors, author_norm = excluded.author_norm",
            params![
                document_id,
                serde_json::to_string(authors)?,
                author_norm.map(serde_json::to_string).transpose()?,
            ],
        )?;
        Ok(())
    }

    /// The document's immutable ordered author list, `None` when the
    /// document is unknown.
    pub fn authors(&self, document_id: &str) -> Result<Option<Vec<String>>> {
        let conn = self.db.lock()?;
        let raw: Option<String> = conn
            .prepare("SELECT authors FROM documents WHERE document_id = ?1")?
            .query_row(params![document_id], |row| row.get(0))
            .optional()?;
        raw.map(|s| serde_json::from_str(&s).map_err(Into::into))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_and_read_authors() {
        let docs = DocumentStore::new(Db::open_in_memory().unwrap());
        let authors = vec!["Stern, Daniel".to_string(), "Zhang, William W.".to_string()];
        docs.put("2015ApJ...1B", &authors, None).unwrap();
        assert_eq!(docs.authors("2015ApJ...1B").unwrap(), Some(authors));
        assert_eq!(docs.authors("nope").unwrap(), None);
    }
}
