//! WriteSink - async write queue in front of the store
//!
//! An actor that owns a store handle and applies write operations in
//! arrival order. Producers choose between fire-and-forget (`send`) and
//! commit-and-return (`send_sync`); `flush` drains everything enqueued
//! before it.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::store::DocumentStore;
use crate::types::{StoreError, WriteOp, WriteReceipt};

enum SinkCommand {
    Write {
        op: WriteOp,
    },
    WriteSync {
        op: WriteOp,
        reply: oneshot::Sender<Result<WriteReceipt, StoreError>>,
    },
    Flush {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the write sink actor
#[derive(Clone)]
pub struct WriteSink {
    tx: mpsc::Sender<SinkCommand>,
}

impl WriteSink {
    /// Spawn the sink actor over the given store
    pub fn spawn(store: Arc<DocumentStore>) -> Self {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(sink_loop(store, rx));
        Self { tx }
    }

    /// Enqueue a write without waiting for commit
    ///
    /// Failures are logged and dropped; callers must not use this for state
    /// that crash recovery depends on.
    pub async fn send(&self, op: WriteOp) {
        if self.tx.send(SinkCommand::Write { op }).await.is_err() {
            warn!("Write sink closed, dropping async write");
        }
    }

    /// Enqueue a write and wait for it to commit
    pub async fn send_sync(&self, op: WriteOp) -> Result<WriteReceipt, StoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SinkCommand::WriteSync { op, reply: reply_tx })
            .await
            .map_err(|_| StoreError::SinkClosed)?;
        reply_rx.await.map_err(|_| StoreError::SinkClosed)?
    }

    /// Wait until every previously enqueued write has been applied
    pub async fn flush(&self) -> Result<(), StoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SinkCommand::Flush { reply: reply_tx })
            .await
            .map_err(|_| StoreError::SinkClosed)?;
        reply_rx.await.map_err(|_| StoreError::SinkClosed)
    }
}

async fn sink_loop(store: Arc<DocumentStore>, mut rx: mpsc::Receiver<SinkCommand>) {
    debug!("Write sink started");

    while let Some(cmd) = rx.recv().await {
        match cmd {
            SinkCommand::Write { op } => {
                let collection = op.collection().to_string();
                if let Err(e) = store.apply(op) {
                    warn!(%collection, error = %e, "Async write failed");
                }
            }
            SinkCommand::WriteSync { op, reply } => {
                let _ = reply.send(store.apply(op));
            }
            SinkCommand::Flush { reply } => {
                // Commands are processed in order, so everything enqueued
                // before the flush has already been applied.
                let _ = reply.send(());
            }
        }
    }

    debug!("Write sink stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Filter;
    use serde_json::json;

    fn test_sink() -> (Arc<DocumentStore>, WriteSink) {
        let store = Arc::new(DocumentStore::open_in_memory().unwrap());
        let sink = WriteSink::spawn(store.clone());
        (store, sink)
    }

    #[tokio::test]
    async fn test_send_sync_returns_receipt() {
        let (store, sink) = test_sink();

        let receipt = sink
            .send_sync(WriteOp::insert("books", json!({"status": "processing"})))
            .await
            .unwrap();

        let doc = store.get("books", &receipt.doc_id).unwrap().unwrap();
        assert_eq!(doc.str_field("status"), Some("processing"));
        assert_eq!(doc.cid, receipt.cid);
    }

    #[tokio::test]
    async fn test_flush_drains_async_writes() {
        let (store, sink) = test_sink();

        for i in 0..10 {
            sink.send(WriteOp::insert("metrics", json!({"i": i}))).await;
        }
        sink.flush().await.unwrap();

        assert_eq!(store.count("metrics").unwrap(), 10);
    }

    #[tokio::test]
    async fn test_ordering_between_async_and_sync() {
        let (store, sink) = test_sink();

        sink.send(WriteOp::upsert_doc("books", "b1", json!({"status": "processing"})))
            .await;
        sink.send_sync(WriteOp::upsert_doc("books", "b1", json!({"status": "complete"})))
            .await
            .unwrap();

        let docs = store.query("books", &[Filter::eq("status", "complete")]).unwrap();
        assert_eq!(docs.len(), 1);
    }
}
