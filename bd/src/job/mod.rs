//! The per-book job
//!
//! `BookJob` owns a `BookState`, turns it into work units, consumes their
//! results, persists progress, and decides completion. Sub-modules hold
//! the unit builders and the completion handlers for each pipeline stage.

pub mod book;
pub mod finalize;
pub mod load;
pub mod op_handlers;
pub mod page_handlers;
pub mod structure;
pub mod units;

pub use book::{BookJob, JobServices, book_job_factory};
pub use load::{create_book, load_book};

use std::time::Duration;

use docstore::{StoreError, WriteOp, WriteReceipt, WriteSink};
use tracing::warn;

/// Store collections the engine reads and writes
pub const BOOKS: &str = "books";
pub const PAGES: &str = "pages";
pub const TOCS: &str = "tocs";
pub const TOC_ENTRIES: &str = "toc_entries";
pub const CHAPTERS: &str = "chapters";
pub const AGENT_STATES: &str = "agent_states";

/// Attempts for correctness-critical persists
const CRITICAL_WRITE_ATTEMPTS: u32 = 3;

/// Sync write with bounded retry and linearly growing, jittered backoff
///
/// The transition being persisted must only flip in memory after this
/// returns Ok ("memory -> sync write -> memory confirms").
pub async fn persist_critical(sink: &WriteSink, op: WriteOp, what: &str) -> Result<WriteReceipt, StoreError> {
    use rand::Rng;

    let mut last_err = None;

    for attempt in 1..=CRITICAL_WRITE_ATTEMPTS {
        match sink.send_sync(op.clone()).await {
            Ok(receipt) => return Ok(receipt),
            Err(e) => {
                warn!(what, attempt, error = %e, "Critical persist failed");
                last_err = Some(e);
                if attempt < CRITICAL_WRITE_ATTEMPTS {
                    let jitter = rand::rng().random_range(0..50);
                    tokio::time::sleep(Duration::from_millis(100 * attempt as u64 + jitter)).await;
                }
            }
        }
    }

    Err(last_err.expect("at least one attempt"))
}
