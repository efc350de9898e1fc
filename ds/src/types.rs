//! Document, filter, and write-operation types

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Unique identifier for a document
pub type DocId = String;

/// Content address of a document body (hex sha-256)
pub type Cid = String;

/// A stored document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Collection this document belongs to
    pub collection: String,

    /// Generated document id (UUID v7)
    pub doc_id: DocId,

    /// Caller-supplied stable key, unique within the collection
    pub unique_key: Option<String>,

    /// The JSON body
    pub body: Value,

    /// Content address of the current body
    pub cid: Cid,

    /// Write version, starts at 1
    pub version: i64,

    /// Last update timestamp (Unix milliseconds)
    pub updated_at: i64,
}

impl Document {
    /// Read a top-level string field from the body
    pub fn str_field(&self, field: &str) -> Option<&str> {
        self.body.get(field).and_then(|v| v.as_str())
    }

    /// Read a top-level u64 field from the body
    pub fn u64_field(&self, field: &str) -> Option<u64> {
        self.body.get(field).and_then(|v| v.as_u64())
    }

    /// Read a top-level bool field from the body
    pub fn bool_field(&self, field: &str) -> Option<bool> {
        self.body.get(field).and_then(|v| v.as_bool())
    }
}

/// Comparison operator for filtered reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    IsNull,
    NotNull,
}

/// A filter over a top-level body field
#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    /// Field equals value
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Eq,
            value: value.into(),
        }
    }

    /// Field differs from value (missing fields match)
    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Ne,
            value: value.into(),
        }
    }

    /// Field is absent or JSON null
    pub fn is_null(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::IsNull,
            value: Value::Null,
        }
    }

    /// Field is present and not JSON null
    pub fn not_null(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::NotNull,
            value: Value::Null,
        }
    }

    /// Check whether a document body matches this filter
    pub fn matches(&self, body: &Value) -> bool {
        let field_value = body.get(&self.field);
        match self.op {
            FilterOp::Eq => field_value == Some(&self.value),
            FilterOp::Ne => field_value != Some(&self.value),
            FilterOp::IsNull => field_value.is_none() || field_value == Some(&Value::Null),
            FilterOp::NotNull => field_value.is_some() && field_value != Some(&Value::Null),
        }
    }
}

/// A write operation accepted by the store and the sink
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Append a new document
    Insert { collection: String, body: Value },

    /// Merge a patch into an existing document's body
    Update {
        collection: String,
        doc_id: DocId,
        patch: Value,
    },

    /// Create-or-update by stable unique key
    Upsert {
        collection: String,
        unique_key: String,
        create: Value,
        patch: Value,
    },
}

impl WriteOp {
    /// Insert a new document
    pub fn insert(collection: impl Into<String>, body: Value) -> Self {
        WriteOp::Insert {
            collection: collection.into(),
            body,
        }
    }

    /// Patch an existing document by id
    pub fn update(collection: impl Into<String>, doc_id: impl Into<String>, patch: Value) -> Self {
        WriteOp::Update {
            collection: collection.into(),
            doc_id: doc_id.into(),
            patch,
        }
    }

    /// Upsert by unique key; `create` is the full body on first write,
    /// `patch` is merged on subsequent writes
    pub fn upsert(collection: impl Into<String>, unique_key: impl Into<String>, create: Value, patch: Value) -> Self {
        WriteOp::Upsert {
            collection: collection.into(),
            unique_key: unique_key.into(),
            create,
            patch,
        }
    }

    /// Upsert where create and patch carry the same fields
    pub fn upsert_doc(collection: impl Into<String>, unique_key: impl Into<String>, body: Value) -> Self {
        WriteOp::Upsert {
            collection: collection.into(),
            unique_key: unique_key.into(),
            create: body.clone(),
            patch: body,
        }
    }

    /// Collection this operation targets
    pub fn collection(&self) -> &str {
        match self {
            WriteOp::Insert { collection, .. } => collection,
            WriteOp::Update { collection, .. } => collection,
            WriteOp::Upsert { collection, .. } => collection,
        }
    }
}

/// Result of a committed write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    pub doc_id: DocId,
    pub cid: Cid,
}

/// Errors from store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("document not found: {collection}/{doc_id}")]
    NotFound { collection: String, doc_id: String },

    #[error("patch must be a JSON object")]
    InvalidPatch,

    #[error("write sink closed")]
    SinkClosed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_eq() {
        let body = json!({"status": "processing", "pages": 12});
        assert!(Filter::eq("status", "processing").matches(&body));
        assert!(!Filter::eq("status", "complete").matches(&body));
        assert!(Filter::eq("pages", 12).matches(&body));
    }

    #[test]
    fn test_filter_ne_matches_missing_field() {
        let body = json!({"status": "processing"});
        assert!(Filter::ne("kind", "page").matches(&body));
        assert!(!Filter::ne("status", "processing").matches(&body));
    }

    #[test]
    fn test_filter_null_checks() {
        let body = json!({"actual_page_id": null, "sort_order": 100});
        assert!(Filter::is_null("actual_page_id").matches(&body));
        assert!(Filter::is_null("missing").matches(&body));
        assert!(Filter::not_null("sort_order").matches(&body));
        assert!(!Filter::not_null("actual_page_id").matches(&body));
    }

    #[test]
    fn test_write_op_collection() {
        let op = WriteOp::insert("metrics", json!({}));
        assert_eq!(op.collection(), "metrics");

        let op = WriteOp::upsert_doc("toc_entries", "k", json!({"a": 1}));
        assert_eq!(op.collection(), "toc_entries");
    }
}
