//! Work-unit builders and the gated book-operation starts

use eyre::{Result, eyre};
use serde_json::{Value, json};
use tracing::{debug, warn};

use docstore::WriteOp;

use crate::agent::{AgentBudgets, AgentType, ToolLoopAgent, toc_finder};
use crate::domain::{
    BookOp, CpuTask, MetricAttribution, PatternSubtype, UnitKind, WorkResult, WorkUnit, WorkUnitInfo,
};

use super::BOOKS;
use super::book::BookJob;

impl BookJob {
    pub(crate) fn budgets(&self) -> AgentBudgets {
        AgentBudgets {
            max_iterations: self.services.engine.agent_max_iterations,
            max_tool_calls: self.services.engine.agent_max_tool_calls,
        }
    }

    pub(crate) fn metric(&self, stage: &str, item_key: String, prompt_key: Option<&str>) -> MetricAttribution {
        MetricAttribution {
            stage: stage.to_string(),
            item_key,
            prompt_key: prompt_key.map(String::from),
            prompt_cid: prompt_key.and_then(|key| self.state.prompts().cid(key)),
            book_id: self.state.book_id().to_string(),
        }
    }

    /// Persist an op's status fields without blocking (start flags; the
    /// crash sweep recovers regardless of whether these land)
    pub(crate) async fn persist_op_async(&self, op: BookOp) {
        let fields = self.state.op(op).to_fields(op.name());
        self.services
            .sink
            .send(WriteOp::update(BOOKS, self.state.book_doc_id(), fields))
            .await;
    }

    // === Page unit builders ===

    fn build_extract(&self, page: u32) -> WorkUnit {
        WorkUnit::cpu(
            self.job_id.clone(),
            CpuTask::ExtractPage {
                pdf_path: self.state.pdf_path().to_path_buf(),
                page,
            },
            self.metric("extract", format!("page:{page}"), None),
        )
    }

    fn build_ocr(&self, page: u32, provider: &str) -> Result<WorkUnit> {
        let record = self.state.page(page).ok_or_else(|| eyre!("page {page} missing"))?;
        let image_path = record
            .image_path
            .ok_or_else(|| eyre!("page {page} has no image for OCR"))?;

        Ok(WorkUnit::ocr(
            self.job_id.clone(),
            provider,
            image_path,
            self.metric("ocr", format!("page:{page}"), None),
        ))
    }

    fn build_blend(&self, page: u32) -> Result<WorkUnit> {
        let record = self.state.page(page).ok_or_else(|| eyre!("page {page} missing"))?;

        let readings: Vec<Value> = self
            .state
            .ocr_providers()
            .iter()
            .filter_map(|provider| {
                record
                    .ocr_results
                    .get(provider)
                    .map(|output| json!({"provider": provider, "text": output.text}))
            })
            .collect();

        let prompt = self.state.prompts().render(
            "blend",
            &json!({"ocr_count": readings.len(), "readings": readings}),
        )?;

        let request = crate::llm::ChatRequest::structured("", prompt, blend_schema());
        Ok(WorkUnit::llm(
            self.job_id.clone(),
            self.state.providers().blend.clone(),
            request,
            self.metric("blend", format!("page:{page}"), Some("blend")),
        ))
    }

    fn build_label(&self, page: u32) -> Result<WorkUnit> {
        let record = self.state.page(page).ok_or_else(|| eyre!("page {page} missing"))?;
        let text = record
            .blended_text
            .ok_or_else(|| eyre!("page {page} not blended"))?;

        let pattern_context = match self.state.pattern() {
            Some(p) => format!(
                "page numbers: {}\nchapter patterns: {}\nbody pages: {}-{}",
                p.page_number_pattern,
                p.chapter_patterns.join("; "),
                p.body_start.unwrap_or(1),
                p.body_end.unwrap_or(self.state.total_pages()),
            ),
            None => "unknown".to_string(),
        };

        let prompt = self.state.prompts().render(
            "label",
            &json!({"pattern_context": pattern_context, "page": page, "page_text": text}),
        )?;

        let request = crate::llm::ChatRequest::structured("", prompt, label_schema());
        Ok(WorkUnit::llm(
            self.job_id.clone(),
            self.state.providers().label.clone(),
            request,
            self.metric("label", format!("page:{page}"), Some("label")),
        ))
    }

    /// Extract unit for a page, registered
    pub(crate) fn extract_unit(&self, page: u32) -> WorkUnit {
        let unit = self.build_extract(page);
        self.register_unit(&unit, WorkUnitInfo::page(UnitKind::Extract, page));
        unit
    }

    /// The page pipeline: OCR fan-out until every provider has a result,
    /// then blend, then (once pattern analysis is in) label
    pub(crate) fn generate_page_work_units(&self, page: u32) -> Result<Vec<WorkUnit>> {
        let record = self.state.page(page).ok_or_else(|| eyre!("page {page} missing"))?;
        let mut units = Vec::new();

        if !record.is_ocr_complete(self.state.ocr_providers()) {
            for provider in self.state.ocr_providers() {
                if !record.ocr_results.contains_key(provider) {
                    let unit = self.build_ocr(page, provider)?;
                    self.register_unit(
                        &unit,
                        WorkUnitInfo::page(UnitKind::Ocr, page).with_provider(provider.clone()),
                    );
                    units.push(unit);
                }
            }
        } else if !record.is_blend_done() {
            let unit = self.build_blend(page)?;
            self.register_unit(&unit, WorkUnitInfo::page(UnitKind::Blend, page));
            units.push(unit);
        } else if self.state.pattern_complete() && !record.is_label_done() {
            let unit = self.build_label(page)?;
            self.register_unit(&unit, WorkUnitInfo::page(UnitKind::Label, page));
            units.push(unit);
        }

        Ok(units)
    }

    /// Rebuild a failed page unit for a retry, carrying the incremented
    /// retry count
    pub(crate) fn rebuild_page_unit(&self, info: WorkUnitInfo) -> Result<Vec<WorkUnit>> {
        let page = info.page.ok_or_else(|| eyre!("page unit without page"))?;

        let unit = match info.kind {
            UnitKind::Extract => self.build_extract(page),
            UnitKind::Ocr => {
                let provider = info.provider.clone().ok_or_else(|| eyre!("ocr unit without provider"))?;
                self.build_ocr(page, &provider)?
            }
            UnitKind::Blend => self.build_blend(page)?,
            UnitKind::Label => self.build_label(page)?,
            other => return Err(eyre!("not a page unit kind: {other:?}")),
        };

        self.register_unit(&unit, info);
        Ok(vec![unit])
    }

    // === Book-op unit builders ===

    fn metadata_unit(&self) -> Result<WorkUnit> {
        let sample: Vec<Value> = self
            .state
            .pages_snapshot()
            .into_iter()
            .take(10)
            .filter_map(|p| {
                p.blended_text
                    .as_ref()
                    .map(|text| json!({"page": p.page, "text": clamp(text, 4000)}))
            })
            .collect();

        let prompt = self.state.prompts().render("metadata", &json!({"pages": sample}))?;
        let request = crate::llm::ChatRequest::structured("", prompt, metadata_schema());

        let unit = WorkUnit::llm(
            self.job_id.clone(),
            self.state.providers().metadata.clone(),
            request,
            self.metric("metadata", "book".to_string(), Some("metadata")),
        );
        self.register_unit(&unit, WorkUnitInfo::book(UnitKind::Metadata));
        Ok(unit)
    }

    pub(crate) fn toc_extract_unit(&self) -> Result<WorkUnit> {
        let toc = self.state.toc();
        let (start, end) = match (toc.start_page, toc.end_page) {
            (Some(s), Some(e)) => (s, e),
            _ => return Err(eyre!("toc extract without a located range")),
        };

        let pages: Vec<Value> = (start..=end)
            .filter_map(|page| {
                self.state
                    .page(page)
                    .and_then(|p| p.blended_text.clone())
                    .map(|text| json!({"page": page, "text": text}))
            })
            .collect();

        let prompt = self.state.prompts().render("toc_extract", &json!({"pages": pages}))?;
        let request = crate::llm::ChatRequest::structured("", prompt, toc_extract_schema());

        let unit = WorkUnit::llm(
            self.job_id.clone(),
            self.state.providers().toc.clone(),
            request,
            self.metric("toc_extract", format!("pages:{start}-{end}"), Some("toc_extract")),
        );
        self.register_unit(&unit, WorkUnitInfo::book(UnitKind::TocExtract));
        Ok(unit)
    }

    pub(crate) fn pattern_unit(&self, subtype: PatternSubtype) -> Result<WorkUnit> {
        let (prompt_key, prompt) = match subtype {
            PatternSubtype::PageNumbers => {
                let samples = self
                    .state
                    .pages_snapshot()
                    .iter()
                    .filter_map(|p| {
                        let label = p.label.as_ref().and_then(|l| l.page_label.clone());
                        let text = p.blended_text.as_deref()?;
                        // Without labels yet, show the page edges where numbers live
                        let line = label.unwrap_or_else(|| edge_lines(text));
                        Some(format!("{} -> {}", p.page, line))
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                (
                    "pattern_page_numbers",
                    self.state
                        .prompts()
                        .render("pattern_page_numbers", &json!({"samples": clamp(&samples, 12000)}))?,
                )
            }
            PatternSubtype::ChapterPatterns => {
                let samples = self
                    .state
                    .pages_snapshot()
                    .iter()
                    .filter_map(|p| {
                        let text = p.blended_text.as_deref()?;
                        let first = text.lines().find(|l| !l.trim().is_empty())?.trim();
                        Some(format!("{} -> {}", p.page, clamp(first, 120)))
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                (
                    "pattern_chapters",
                    self.state
                        .prompts()
                        .render("pattern_chapters", &json!({"samples": clamp(&samples, 12000)}))?,
                )
            }
            PatternSubtype::BodyBoundaries => {
                let (page_numbers, chapters) = self
                    .state
                    .pattern_partials()
                    .ok_or_else(|| eyre!("boundaries unit before prerequisite partials"))?;

                let total = self.state.total_pages();
                let excerpts = [1, 2, 3, total.saturating_sub(2), total.saturating_sub(1), total]
                    .iter()
                    .filter_map(|&page| {
                        self.state
                            .page(page)
                            .and_then(|p| p.blended_text.clone())
                            .map(|text| format!("=== Page {page} ===\n{}", clamp(&text, 1200)))
                    })
                    .collect::<Vec<_>>()
                    .join("\n\n");

                (
                    "pattern_boundaries",
                    self.state.prompts().render(
                        "pattern_boundaries",
                        &json!({
                            "page_number_analysis": page_numbers,
                            "chapter_analysis": chapters,
                            "excerpts": excerpts,
                        }),
                    )?,
                )
            }
        };

        let schema = match subtype {
            PatternSubtype::PageNumbers => json!({
                "type": "object",
                "properties": {
                    "pattern": { "type": "string" },
                    "reasoning": { "type": "string" }
                },
                "required": ["pattern"]
            }),
            PatternSubtype::ChapterPatterns => json!({
                "type": "object",
                "properties": {
                    "patterns": { "type": "array", "items": { "type": "string" } },
                    "reasoning": { "type": "string" }
                },
                "required": ["patterns"]
            }),
            PatternSubtype::BodyBoundaries => json!({
                "type": "object",
                "properties": {
                    "body_start": { "type": "integer" },
                    "body_end": { "type": "integer" },
                    "reasoning": { "type": "string" }
                },
                "required": ["body_start", "body_end"]
            }),
        };

        let request = crate::llm::ChatRequest::structured("", prompt, schema);
        let unit = WorkUnit::llm(
            self.job_id.clone(),
            self.state.providers().label.clone(),
            request,
            self.metric("pattern_analysis", format!("{subtype:?}"), Some(prompt_key)),
        );
        self.register_unit(
            &unit,
            WorkUnitInfo::book(UnitKind::PatternAnalysis).with_subtype(subtype),
        );
        Ok(unit)
    }

    /// Emit the next LLM unit for an agent, registered under the given info
    pub(crate) fn agent_unit(
        &self,
        agent: &mut ToolLoopAgent,
        info: WorkUnitInfo,
        stage: &str,
        item_key: String,
        prompt_key: &str,
    ) -> Option<WorkUnit> {
        let request = agent.next_request()?;
        let unit = WorkUnit::llm(
            self.job_id.clone(),
            self.state.providers().toc.clone(),
            request,
            self.metric(stage, item_key, Some(prompt_key)),
        );
        self.register_unit(&unit, info);
        Some(unit)
    }

    // === ToC finder start/resume ===

    /// Build (or rehydrate) the finder and emit its first unit. The op is
    /// already InProgress when this runs.
    pub(crate) async fn start_toc_finder(&self) -> Result<Vec<WorkUnit>> {
        let mut agent = toc_finder::new_agent(&self.state, self.budgets())?;

        if let Some(saved) = self.state.agent_state(AgentType::TocFinder, toc_finder::INSTANCE_KEY)
            && !saved.complete
        {
            debug!(book_id = %self.state.book_id(), iteration = saved.iteration, "Rehydrating toc finder");
            agent.restore_state(&saved);
        }

        self.persist_agent_state(&agent, true).await?;

        let unit = self.agent_unit(
            &mut agent,
            WorkUnitInfo::book(UnitKind::TocFinder),
            "toc_find",
            "toc".to_string(),
            "toc_find_system",
        );

        self.agents
            .lock()
            .await
            .insert((AgentType::TocFinder, toc_finder::INSTANCE_KEY.to_string()), agent);

        Ok(unit.into_iter().collect())
    }

    /// Crash path: only resume the finder when a usable checkpoint exists
    pub(crate) async fn resume_toc_finder(&self) -> Result<Vec<WorkUnit>> {
        match self.state.agent_state(AgentType::TocFinder, toc_finder::INSTANCE_KEY) {
            Some(saved) if !saved.complete => self.start_toc_finder().await,
            _ => self.fail_book_op(BookOp::TocFinder).await,
        }
    }

    // === Gated starts ===

    /// Each guard: (precondition && can_start) => start -> build units;
    /// a build failure resets the op so no start is lost
    pub(crate) async fn maybe_start_book_operations(&self) -> Result<Vec<WorkUnit>> {
        let state = &self.state;
        let cfg = &self.services.engine;
        let mut units = Vec::new();

        // metadata: enough labeled pages
        let label_threshold = cfg.label_threshold_for_book_ops.min(state.total_pages());
        if state.labeled_count() >= label_threshold && state.op(BookOp::Metadata).can_start() {
            state.with_op(BookOp::Metadata, |op| op.start());
            match self.metadata_unit() {
                Ok(unit) => {
                    self.persist_op_async(BookOp::Metadata).await;
                    units.push(unit);
                }
                Err(e) => {
                    warn!(error = %e, "Could not build metadata unit, resetting op");
                    state.with_op(BookOp::Metadata, |op| op.reset());
                }
            }
        }

        // toc_finder: the leading pages have blended
        let front_required = cfg.consecutive_front_matter_required.min(state.total_pages());
        if state.first_pages_blended(front_required) && state.op(BookOp::TocFinder).can_start() {
            state.with_op(BookOp::TocFinder, |op| op.start());
            match self.start_toc_finder().await {
                Ok(found) => {
                    self.persist_op_async(BookOp::TocFinder).await;
                    units.extend(found);
                }
                Err(e) => {
                    warn!(error = %e, "Could not start toc finder, resetting op");
                    state.with_op(BookOp::TocFinder, |op| op.reset());
                }
            }
        }

        // toc_extract: the finder located a ToC
        if state.op(BookOp::TocFinder).is_done() && state.toc_found() && state.op(BookOp::TocExtract).can_start() {
            state.with_op(BookOp::TocExtract, |op| op.start());
            match self.toc_extract_unit() {
                Ok(unit) => {
                    self.persist_op_async(BookOp::TocExtract).await;
                    units.push(unit);
                }
                Err(e) => {
                    warn!(error = %e, "Could not build toc extract unit, resetting op");
                    state.with_op(BookOp::TocExtract, |op| op.reset());
                }
            }
        }

        // pattern_analysis: every page blended; two sub-units up front,
        // boundaries once both are back
        if state.all_pages_blended()
            && state.op(BookOp::PatternAnalysis).can_start()
            && !self.has_inflight(UnitKind::PatternAnalysis)
        {
            state.with_op(BookOp::PatternAnalysis, |op| op.start());
            let built = self
                .pattern_unit(PatternSubtype::PageNumbers)
                .and_then(|first| Ok(vec![first, self.pattern_unit(PatternSubtype::ChapterPatterns)?]));
            match built {
                Ok(pair) => {
                    self.persist_op_async(BookOp::PatternAnalysis).await;
                    units.extend(pair);
                }
                Err(e) => {
                    warn!(error = %e, "Could not build pattern units, resetting op");
                    // Drop any registration from the half-built pair; the
                    // can_start guard means none were in flight before
                    self.units
                        .lock()
                        .expect("units lock poisoned")
                        .retain(|_, info| info.kind != UnitKind::PatternAnalysis);
                    state.with_op(BookOp::PatternAnalysis, |op| op.reset());
                }
            }
        }

        // toc_link: entries extracted, patterns known, every page labeled
        if state.op(BookOp::TocExtract).is_done()
            && state.op(BookOp::PatternAnalysis).is_complete()
            && state.all_pages_labeled()
            && state.op(BookOp::TocLink).can_start()
        {
            state.with_op(BookOp::TocLink, |op| op.start());
            match self.start_link_agents().await {
                Ok(found) => {
                    self.persist_op_async(BookOp::TocLink).await;
                    units.extend(found);
                }
                Err(e) => {
                    warn!(error = %e, "Could not start link agents, resetting op");
                    state.with_op(BookOp::TocLink, |op| op.reset());
                }
            }
        }

        // toc_finalize: linking succeeded
        if state.op(BookOp::TocLink).is_complete() && state.op(BookOp::TocFinalize).can_start() {
            state.with_op(BookOp::TocFinalize, |op| op.start());
            match self.enter_finalize_phase().await {
                Ok(found) => {
                    self.persist_op_async(BookOp::TocFinalize).await;
                    units.extend(found);
                }
                Err(e) => {
                    warn!(error = %e, "Could not enter finalize, resetting op");
                    state.with_op(BookOp::TocFinalize, |op| op.reset());
                }
            }
        }

        // structure: the ToC is closed
        if state.op(BookOp::TocFinalize).is_complete() && state.op(BookOp::Structure).can_start() {
            state.with_op(BookOp::Structure, |op| op.start());
            match self.advance_structure().await {
                Ok(found) => {
                    self.persist_op_async(BookOp::Structure).await;
                    units.extend(found);
                }
                Err(e) => {
                    warn!(error = %e, "Could not start structure, resetting op");
                    state.with_op(BookOp::Structure, |op| op.reset());
                }
            }
        }

        Ok(units)
    }

    /// Route a successful completion to its stage handler
    pub(crate) async fn dispatch_handler(&self, info: &WorkUnitInfo, result: &WorkResult) -> Result<Vec<WorkUnit>> {
        match info.kind {
            UnitKind::Extract => self.handle_extract(info, result).await,
            UnitKind::Ocr => self.handle_ocr(info, result).await,
            UnitKind::Blend => self.handle_blend(info, result).await,
            UnitKind::Label => self.handle_label(info, result).await,
            UnitKind::Metadata => self.handle_metadata(result).await,
            UnitKind::TocFinder => self.handle_toc_finder(result).await,
            UnitKind::TocExtract => self.handle_toc_extract(result).await,
            UnitKind::PatternAnalysis => self.handle_pattern(info, result).await,
            UnitKind::TocLink => self.handle_link(info, result).await,
            UnitKind::FinalizePattern => self.handle_finalize_pattern(result).await,
            UnitKind::FinalizeDiscover => self.handle_discover(info, result).await,
            UnitKind::FinalizeValidate => self.handle_validate(info, result).await,
            UnitKind::StructureMerge => self.handle_structure_merge(info, result).await,
            UnitKind::StructureClassify => self.handle_structure_classify(result).await,
            UnitKind::StructurePolish => self.handle_structure_polish(info, result).await,
        }
    }
}

/// First and last non-empty lines of a page, where printed numbers live
fn edge_lines(text: &str) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    match (lines.first(), lines.last()) {
        (Some(first), Some(last)) if lines.len() > 1 => format!("{} | {}", clamp(first.trim(), 60), clamp(last.trim(), 60)),
        (Some(first), _) => clamp(first.trim(), 60),
        _ => String::new(),
    }
}

pub(crate) fn clamp(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &text[..end])
    }
}

fn blend_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "blended_text": { "type": "string" }
        },
        "required": ["blended_text"]
    })
}

fn label_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "page_label": { "type": ["string", "null"] },
            "headings": { "type": "array", "items": { "type": "string" } },
            "header": { "type": ["string", "null"] },
            "footer": { "type": ["string", "null"] },
            "is_toc_page": { "type": "boolean" }
        },
        "required": ["is_toc_page"]
    })
}

fn metadata_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "title": { "type": ["string", "null"] },
            "author": { "type": ["string", "null"] },
            "publisher": { "type": ["string", "null"] },
            "year": { "type": ["string", "null"] },
            "language": { "type": ["string", "null"] }
        }
    })
}

fn toc_extract_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "entries": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "title": { "type": "string" },
                        "level": { "type": "integer" },
                        "identifier": { "type": ["string", "null"] },
                        "printed_page": { "type": ["string", "null"] }
                    },
                    "required": ["title"]
                }
            }
        },
        "required": ["entries"]
    })
}
