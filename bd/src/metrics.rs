//! Per-unit metric records
//!
//! The scheduler emits one metric per completed work unit through the
//! write sink (fire-and-forget). Metric rows are upserted under the unit
//! id, so the producing handler can back-fill the artifact reference once
//! the output document commits.

use docstore::{WriteOp, WriteReceipt, WriteSink};
use serde_json::json;
use uuid::Uuid;

use crate::domain::{MetricAttribution, WorkResult};

/// Collection metric rows live in
pub const METRICS_COLLECTION: &str = "metrics";

/// Stable upsert key for a unit's metric row
pub fn metric_key(unit_id: Uuid) -> String {
    format!("metric:{unit_id}")
}

/// Emit the metric for a completed unit
pub async fn emit_metric(sink: &WriteSink, attribution: &MetricAttribution, result: &WorkResult, cost_usd: f64) {
    let body = json!({
        "unit_id": result.unit_id.to_string(),
        "stage": attribution.stage,
        "item_key": attribution.item_key,
        "prompt_key": attribution.prompt_key,
        "prompt_cid": attribution.prompt_cid,
        "book_id": attribution.book_id,
        "success": result.success,
        "error": result.error,
        "tokens_in": result.usage.input_tokens,
        "tokens_out": result.usage.output_tokens,
        "cost_usd": cost_usd,
        "latency_ms": result.latency_ms,
        "recorded_at": chrono::Utc::now().timestamp_millis(),
    });

    sink.send(WriteOp::upsert_doc(METRICS_COLLECTION, metric_key(result.unit_id), body))
        .await;
}

/// Back-fill the produced artifact's doc id and CID onto a metric row
pub async fn update_metric_output_ref(sink: &WriteSink, unit_id: Uuid, receipt: &WriteReceipt) {
    let patch = json!({
        "output_doc_id": receipt.doc_id,
        "output_cid": receipt.cid,
    });

    sink.send(WriteOp::Upsert {
        collection: METRICS_COLLECTION.to_string(),
        unique_key: metric_key(unit_id),
        create: patch.clone(),
        patch,
    })
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CpuOutcome, WorkOutcome};
    use docstore::{DocumentStore, Filter};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_emit_and_backfill() {
        let store = Arc::new(DocumentStore::open_in_memory().unwrap());
        let sink = WriteSink::spawn(store.clone());

        let unit_id = Uuid::new_v4();
        let attribution = MetricAttribution {
            stage: "blend".to_string(),
            item_key: "page:5".to_string(),
            prompt_key: Some("blend".to_string()),
            prompt_cid: Some("abc".to_string()),
            book_id: "b1".to_string(),
        };
        let result = WorkResult::ok(
            unit_id,
            WorkOutcome::Cpu(CpuOutcome::ChapterMerged {
                chapter_key: "k".to_string(),
                text: String::new(),
                word_count: 0,
            }),
        );

        emit_metric(&sink, &attribution, &result, 0.01).await;
        update_metric_output_ref(
            &sink,
            unit_id,
            &WriteReceipt {
                doc_id: "d1".to_string(),
                cid: "cid1".to_string(),
            },
        )
        .await;
        sink.flush().await.unwrap();

        let rows = store.query(METRICS_COLLECTION, &[Filter::eq("book_id", "b1")]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].str_field("stage"), Some("blend"));
        assert_eq!(rows[0].str_field("output_doc_id"), Some("d1"));
        assert_eq!(rows[0].str_field("output_cid"), Some("cid1"));
    }
}
