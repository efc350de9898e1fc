//! Book loading - materialize a BookState from the store
//!
//! Everything a resumed job needs comes back in one pass: page records,
//! op statuses, cached ToC entries, pattern results, saved agent states,
//! chapters, and cost totals.

use std::path::PathBuf;
use std::sync::Arc;

use docstore::{DocumentStore, Filter, WriteOp};
use eyre::{Result, eyre};
use serde_json::json;
use tracing::{debug, info};

use crate::agent::AgentState;
use crate::config::EngineConfig;
use crate::domain::{
    BookMetadata, BookOp, BookProviders, BookState, ChapterState, CostTotals, FinalizePhase, OperationState, TocEntry,
    TocInfo,
};
use crate::ocr::OcrOutput;
use crate::prompts::PromptSet;

use super::{AGENT_STATES, BOOKS, CHAPTERS, PAGES, TOCS, TOC_ENTRIES};

/// Create the book document for a new ingest; idempotent by book id
pub async fn create_book(
    sink: &docstore::WriteSink,
    book_id: &str,
    pdf_path: &std::path::Path,
    total_pages: u32,
) -> Result<String> {
    let receipt = sink
        .send_sync(WriteOp::upsert_doc(
            BOOKS,
            book_id.to_string(),
            json!({
                "book_id": book_id,
                "status": "ingested",
                "pdf_path": pdf_path.display().to_string(),
                "total_pages": total_pages,
            }),
        ))
        .await?;

    info!(book_id, total_pages, "Book ingested");
    Ok(receipt.doc_id)
}

/// Materialize the full BookState for a book
pub async fn load_book(
    store: &Arc<DocumentStore>,
    engine: &EngineConfig,
    prompts: PromptSet,
    book_id: &str,
) -> Result<Arc<BookState>> {
    let book_doc = store
        .get_by_unique_key(BOOKS, book_id)?
        .ok_or_else(|| eyre!("book {book_id} not found"))?;

    let total_pages = book_doc
        .u64_field("total_pages")
        .ok_or_else(|| eyre!("book {book_id} missing total_pages"))? as u32;
    let pdf_path = PathBuf::from(book_doc.str_field("pdf_path").unwrap_or_default());

    let state = BookState::new(
        book_id,
        book_doc.doc_id.clone(),
        pdf_path,
        total_pages,
        engine.ocr_providers.clone(),
        BookProviders {
            blend: engine.blend_provider.clone(),
            label: engine.label_provider.clone(),
            metadata: engine.metadata_provider.clone(),
            toc: engine.toc_provider.clone(),
        },
        prompts,
    );

    // Operation statuses
    for op in BookOp::all() {
        let name = op.name();
        let loaded = OperationState::from_fields(
            book_doc.bool_field(&format!("{name}_started")).unwrap_or(false),
            book_doc.bool_field(&format!("{name}_complete")).unwrap_or(false),
            book_doc.bool_field(&format!("{name}_failed")).unwrap_or(false),
            book_doc.u64_field(&format!("{name}_retries")).unwrap_or(0) as u32,
        );
        state.set_op(op, loaded);
    }

    // Book-level artifacts
    if let Some(pattern) = book_doc.body.get("pattern_analysis_json")
        && !pattern.is_null()
        && let Ok(parsed) = serde_json::from_value(pattern.clone())
    {
        state.set_pattern(parsed);
    }

    if let Some(phase) = book_doc.str_field("finalize_phase")
        && let Ok(parsed) = serde_json::from_value::<FinalizePhase>(json!(phase))
    {
        state.set_finalize_phase(parsed);
    }

    if let Some(pattern) = book_doc.body.get("finalize_pattern_json")
        && !pattern.is_null()
        && let Ok(parsed) = serde_json::from_value(pattern.clone())
    {
        state.set_finalize_pattern(parsed);
    }

    state.set_metadata(BookMetadata {
        title: book_doc.str_field("title").map(String::from),
        author: book_doc.str_field("author").map(String::from),
        publisher: book_doc.str_field("publisher").map(String::from),
        year: book_doc.str_field("year").map(String::from),
        language: book_doc.str_field("language").map(String::from),
    });

    state.set_costs(CostTotals {
        tokens_in: book_doc.u64_field("tokens_in").unwrap_or(0),
        tokens_out: book_doc.u64_field("tokens_out").unwrap_or(0),
        cost_usd: book_doc.body.get("cost_usd").and_then(|v| v.as_f64()).unwrap_or(0.0),
        ..Default::default()
    });

    // Pages
    let page_docs = store.query(PAGES, &[Filter::eq("book_id", book_id)])?;
    for doc in &page_docs {
        let Some(page) = doc.u64_field("page").map(|p| p as u32) else {
            continue;
        };

        state.get_or_create_page(page);
        state.update_page(page, |record| {
            record.doc_id = Some(doc.doc_id.clone());
            record.extract_done = doc.bool_field("extract_done").unwrap_or(false);
            record.image_path = doc.str_field("image_path").map(PathBuf::from);
            record.embedded_text = doc.str_field("embedded_text").map(String::from);
            record.blended_text = doc.str_field("blended_text").map(String::from);

            for provider in engine.ocr_providers.iter() {
                if let Some(text) = doc.str_field(&format!("ocr_{provider}_text")) {
                    record.ocr_results.insert(
                        provider.clone(),
                        OcrOutput {
                            text: text.to_string(),
                            markdown: doc.str_field(&format!("ocr_{provider}_markdown")).map(String::from),
                            ..Default::default()
                        },
                    );
                }
            }

            if let Some(label) = doc.body.get("label")
                && !label.is_null()
                && let Ok(parsed) = serde_json::from_value(label.clone())
            {
                record.label = Some(parsed);
            }
        });
    }

    // ToC and entries
    if let Some(toc_doc) = store.get_by_unique_key(TOCS, &format!("{book_id}:toc"))? {
        let toc = TocInfo {
            doc_id: Some(toc_doc.doc_id.clone()),
            found: toc_doc.bool_field("found").unwrap_or(false),
            start_page: toc_doc.u64_field("start_page").map(|p| p as u32),
            end_page: toc_doc.u64_field("end_page").map(|p| p as u32),
        };
        state.set_toc(toc);

        let entry_docs = store.query(TOC_ENTRIES, &[Filter::eq("toc_id", &*toc_doc.doc_id)])?;
        let mut entries: Vec<TocEntry> = entry_docs
            .iter()
            .map(|doc| TocEntry::from_doc(&doc.doc_id, &doc.body))
            .collect();
        entries.sort_by_key(|e| e.sort_order);
        state.set_entries(entries);
    }

    // Chapters
    let chapter_docs = store.query(CHAPTERS, &[Filter::eq("book_id", book_id)])?;
    let mut chapters: Vec<ChapterState> = chapter_docs
        .iter()
        .map(|doc| ChapterState::from_doc(&doc.doc_id, &doc.body))
        .collect();
    chapters.sort_by_key(|c| c.sort_order);
    state.set_chapters(chapters);

    // Saved agent states; only non-complete checkpoints matter for
    // resumption
    let agent_docs = store.query(
        AGENT_STATES,
        &[Filter::eq("book_id", book_id), Filter::eq("complete", false)],
    )?;
    for doc in &agent_docs {
        if let Some(raw) = doc.body.get("state")
            && let Ok(saved) = serde_json::from_value::<AgentState>(raw.clone())
        {
            debug!(
                book_id,
                agent = %saved.agent_type,
                key = %saved.instance_key,
                iteration = saved.iteration,
                "Loaded agent checkpoint"
            );
            state.save_agent_state(saved);
        }
    }

    info!(
        book_id,
        pages = page_docs.len(),
        entries = state.entries().len(),
        chapters = state.chapters().len(),
        "Book loaded"
    );
    Ok(Arc::new(state))
}
