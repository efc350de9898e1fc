//! DocStore - versioned JSON document store
//!
//! A small persistent store for JSON documents organized into collections,
//! plus an async write sink for decoupling producers from commit latency.
//!
//! # Core Concepts
//!
//! - **Documents are JSON**: every record is a JSON object with a generated
//!   doc id, an optional caller-supplied unique key, and a content address
//!   (CID) recomputed on every write
//! - **Upserts are idempotent**: writing the same unique key twice updates
//!   the existing document instead of duplicating it
//! - **Sync when it matters**: `WriteSink::send` is fire-and-forget,
//!   `WriteSink::send_sync` blocks until the write is committed and returns
//!   the new doc id + CID

pub mod sink;
pub mod store;
pub mod types;

pub use sink::WriteSink;
pub use store::DocumentStore;
pub use types::{Cid, DocId, Document, Filter, FilterOp, StoreError, WriteOp, WriteReceipt};
