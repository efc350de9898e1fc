//! Page pipeline completion handlers: extract, ocr, blend, label
//!
//! Page milestones persist synchronously so a resumed job re-emits only
//! the stages that never committed (a crashed blend re-runs; a committed
//! one does not).

use eyre::{Result, eyre};
use serde_json::json;
use tracing::debug;

use docstore::WriteOp;

use crate::domain::{CpuOutcome, PageLabel, WorkResult, WorkUnit, WorkUnitInfo};
use crate::metrics::update_metric_output_ref;

use super::PAGES;
use super::book::BookJob;

impl BookJob {
    fn page_doc_id_for(&self, page: u32) -> Result<String> {
        self.state
            .page_doc_id(page)
            .ok_or_else(|| eyre!("page {page} has no document"))
    }

    /// extract: mark the page extracted, persist, then fan out OCR
    pub(crate) async fn handle_extract(&self, info: &WorkUnitInfo, result: &WorkResult) -> Result<Vec<WorkUnit>> {
        let page = info.page.ok_or_else(|| eyre!("extract unit without page"))?;
        let Some(CpuOutcome::PageExtracted {
            image_path,
            embedded_text,
        }) = result.cpu()
        else {
            return Err(eyre!("extract unit returned wrong outcome"));
        };

        let doc_id = self.page_doc_id_for(page)?;
        self.services
            .sink
            .send_sync(WriteOp::update(
                PAGES,
                &doc_id,
                json!({
                    "extract_done": true,
                    "image_path": image_path.display().to_string(),
                    "embedded_text": embedded_text,
                }),
            ))
            .await?;

        self.state.update_page(page, |p| {
            p.extract_done = true;
            p.image_path = Some(image_path.clone());
            p.embedded_text = embedded_text.clone();
        });

        debug!(book_id = %self.state.book_id(), page, "Page extracted");
        self.generate_page_work_units(page)
    }

    /// ocr: record the provider's result; blend fires once every provider
    /// has reported
    pub(crate) async fn handle_ocr(&self, info: &WorkUnitInfo, result: &WorkResult) -> Result<Vec<WorkUnit>> {
        let page = info.page.ok_or_else(|| eyre!("ocr unit without page"))?;
        let provider = info
            .provider
            .clone()
            .ok_or_else(|| eyre!("ocr unit without provider"))?;
        let output = result.ocr().ok_or_else(|| eyre!("ocr unit returned wrong outcome"))?;

        let doc_id = self.page_doc_id_for(page)?;
        self.services
            .sink
            .send_sync(WriteOp::update(
                PAGES,
                &doc_id,
                json!({
                    format!("ocr_{provider}_text"): output.text,
                    format!("ocr_{provider}_markdown"): output.markdown,
                }),
            ))
            .await?;

        self.state.update_page(page, |p| {
            p.ocr_results.insert(provider.clone(), output.clone());
        });

        debug!(book_id = %self.state.book_id(), page, provider, "OCR complete");
        self.generate_page_work_units(page)
    }

    /// blend: store the fused text; label fires only once pattern
    /// analysis is complete
    pub(crate) async fn handle_blend(&self, info: &WorkUnitInfo, result: &WorkResult) -> Result<Vec<WorkUnit>> {
        let page = info.page.ok_or_else(|| eyre!("blend unit without page"))?;
        let chat = result.chat().ok_or_else(|| eyre!("blend unit returned wrong outcome"))?;
        let parsed = chat
            .parsed_json
            .as_ref()
            .ok_or_else(|| eyre!("blend returned no structured result"))?;
        let text = parsed["blended_text"]
            .as_str()
            .ok_or_else(|| eyre!("blend result missing blended_text"))?;

        let doc_id = self.page_doc_id_for(page)?;
        let receipt = self
            .services
            .sink
            .send_sync(WriteOp::update(
                PAGES,
                &doc_id,
                json!({"blended_text": text, "blend_done": true}),
            ))
            .await?;
        update_metric_output_ref(&self.services.sink, result.unit_id, &receipt).await;

        self.state.update_page(page, |p| {
            p.blended_text = Some(text.to_string());
        });

        debug!(book_id = %self.state.book_id(), page, "Page blended");
        self.generate_page_work_units(page)
    }

    /// label: parse and store the page label
    pub(crate) async fn handle_label(&self, info: &WorkUnitInfo, result: &WorkResult) -> Result<Vec<WorkUnit>> {
        let page = info.page.ok_or_else(|| eyre!("label unit without page"))?;
        let chat = result.chat().ok_or_else(|| eyre!("label unit returned wrong outcome"))?;
        let parsed = chat
            .parsed_json
            .as_ref()
            .ok_or_else(|| eyre!("label returned no structured result"))?;

        let label: PageLabel = serde_json::from_value(parsed.clone())
            .map_err(|e| eyre!("label result did not parse: {e}"))?;

        let doc_id = self.page_doc_id_for(page)?;
        let receipt = self
            .services
            .sink
            .send_sync(WriteOp::update(
                PAGES,
                &doc_id,
                json!({
                    "label": parsed,
                    "label_done": true,
                    "page_label": label.page_label,
                    "is_toc_page": label.is_toc_page,
                }),
            ))
            .await?;
        update_metric_output_ref(&self.services.sink, result.unit_id, &receipt).await;

        self.state.update_page(page, |p| {
            p.label = Some(label);
        });

        debug!(book_id = %self.state.book_id(), page, "Page labeled");
        Ok(Vec::new())
    }
}
