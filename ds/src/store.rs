//! Core DocumentStore implementation

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::types::{Cid, DocId, Document, Filter, StoreError, WriteOp, WriteReceipt};

/// The document store
///
/// All access is serialized through one connection; operations are short
/// (single-row reads and writes) so contention stays low even with many
/// concurrent work units.
pub struct DocumentStore {
    conn: Mutex<Connection>,
}

impl DocumentStore {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(&conn)?;
        debug!(path = %path.as_ref().display(), "Opened document store");
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Open an in-memory store (tests)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn init(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS documents (
                collection  TEXT NOT NULL,
                doc_id      TEXT NOT NULL,
                unique_key  TEXT,
                body        TEXT NOT NULL,
                cid         TEXT NOT NULL,
                version     INTEGER NOT NULL,
                updated_at  INTEGER NOT NULL,
                PRIMARY KEY (collection, doc_id)
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_documents_unique_key
                ON documents (collection, unique_key)
                WHERE unique_key IS NOT NULL;",
        )?;
        Ok(())
    }

    /// Get a document by id
    pub fn get(&self, collection: &str, doc_id: &str) -> Result<Option<Document>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let row = conn
            .query_row(
                "SELECT collection, doc_id, unique_key, body, cid, version, updated_at
                 FROM documents WHERE collection = ?1 AND doc_id = ?2",
                params![collection, doc_id],
                row_to_document,
            )
            .optional()?;
        Ok(row)
    }

    /// Get a document by its stable unique key
    pub fn get_by_unique_key(&self, collection: &str, unique_key: &str) -> Result<Option<Document>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let row = conn
            .query_row(
                "SELECT collection, doc_id, unique_key, body, cid, version, updated_at
                 FROM documents WHERE collection = ?1 AND unique_key = ?2",
                params![collection, unique_key],
                row_to_document,
            )
            .optional()?;
        Ok(row)
    }

    /// Filtered read over a collection
    ///
    /// Filters apply to top-level body fields. Results are ordered by
    /// insertion (doc ids are UUID v7, so lexicographic order is creation
    /// order).
    pub fn query(&self, collection: &str, filters: &[Filter]) -> Result<Vec<Document>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT collection, doc_id, unique_key, body, cid, version, updated_at
             FROM documents WHERE collection = ?1 ORDER BY doc_id",
        )?;
        let rows = stmt.query_map(params![collection], row_to_document)?;

        let mut out = Vec::new();
        for row in rows {
            let doc = row?;
            if filters.iter().all(|f| f.matches(&doc.body)) {
                out.push(doc);
            }
        }
        Ok(out)
    }

    /// Count documents in a collection
    pub fn count(&self, collection: &str) -> Result<usize, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE collection = ?1",
            params![collection],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// Apply a write operation
    pub fn apply(&self, op: WriteOp) -> Result<WriteReceipt, StoreError> {
        match op {
            WriteOp::Insert { collection, body } => self.insert(&collection, body),
            WriteOp::Update {
                collection,
                doc_id,
                patch,
            } => self.update(&collection, &doc_id, patch),
            WriteOp::Upsert {
                collection,
                unique_key,
                create,
                patch,
            } => self.upsert(&collection, &unique_key, create, patch),
        }
    }

    /// Append a new document, returning its id and CID
    pub fn insert(&self, collection: &str, body: Value) -> Result<WriteReceipt, StoreError> {
        let doc_id = Uuid::now_v7().to_string();
        self.write_row(collection, &doc_id, None, body, 1)
    }

    /// Merge a patch into an existing document's body
    ///
    /// Top-level fields of the patch replace the corresponding body fields;
    /// other body fields are preserved.
    pub fn update(&self, collection: &str, doc_id: &str, patch: Value) -> Result<WriteReceipt, StoreError> {
        let existing = self.get(collection, doc_id)?.ok_or_else(|| StoreError::NotFound {
            collection: collection.to_string(),
            doc_id: doc_id.to_string(),
        })?;

        let mut body = existing.body;
        merge_patch(&mut body, patch)?;
        self.write_row(collection, doc_id, existing.unique_key.as_deref(), body, existing.version + 1)
    }

    /// Create-or-update by stable unique key
    ///
    /// Retries and resumes hit the update path, so engine-generated inserts
    /// never duplicate.
    pub fn upsert(
        &self,
        collection: &str,
        unique_key: &str,
        create: Value,
        patch: Value,
    ) -> Result<WriteReceipt, StoreError> {
        match self.get_by_unique_key(collection, unique_key)? {
            Some(existing) => {
                let mut body = existing.body;
                merge_patch(&mut body, patch)?;
                self.write_row(
                    collection,
                    &existing.doc_id,
                    Some(unique_key),
                    body,
                    existing.version + 1,
                )
            }
            None => {
                let doc_id = Uuid::now_v7().to_string();
                self.write_row(collection, &doc_id, Some(unique_key), create, 1)
            }
        }
    }

    fn write_row(
        &self,
        collection: &str,
        doc_id: &str,
        unique_key: Option<&str>,
        body: Value,
        version: i64,
    ) -> Result<WriteReceipt, StoreError> {
        let cid = compute_cid(&body);
        let body_text = serde_json::to_string(&body)?;
        let now = chrono::Utc::now().timestamp_millis();

        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT INTO documents (collection, doc_id, unique_key, body, cid, version, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (collection, doc_id) DO UPDATE SET
                 unique_key = excluded.unique_key,
                 body = excluded.body,
                 cid = excluded.cid,
                 version = excluded.version,
                 updated_at = excluded.updated_at",
            params![collection, doc_id, unique_key, body_text, cid, version, now],
        )?;

        Ok(WriteReceipt {
            doc_id: doc_id.to_string(),
            cid,
        })
    }
}

/// Content address: hex sha-256 of the serialized body
pub fn compute_cid(body: &Value) -> Cid {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    format!("{digest:x}")
}

fn merge_patch(body: &mut Value, patch: Value) -> Result<(), StoreError> {
    let Value::Object(patch_map) = patch else {
        return Err(StoreError::InvalidPatch);
    };
    let Value::Object(body_map) = body else {
        *body = Value::Object(patch_map);
        return Ok(());
    };
    for (key, value) in patch_map {
        body_map.insert(key, value);
    }
    Ok(())
}

fn row_to_document(row: &rusqlite::Row<'_>) -> rusqlite::Result<Document> {
    let body_text: String = row.get(3)?;
    let body: Value = serde_json::from_str(&body_text).unwrap_or(Value::Null);
    Ok(Document {
        collection: row.get(0)?,
        doc_id: row.get(1)?,
        unique_key: row.get(2)?,
        body,
        cid: row.get(4)?,
        version: row.get(5)?,
        updated_at: row.get(6)?,
    })
}
