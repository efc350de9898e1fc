//! BookState - root in-memory aggregate for one book
//!
//! All mutable data for a book job lives here, behind narrow accessors
//! that encapsulate locking per field family. Handlers additionally
//! serialize through the job, so accessors only guard against concurrent
//! readers (agent tools hold a reference while work executes elsewhere).
//! Agents read, never mutate.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::AgentState;
use crate::domain::chapter::ChapterState;
use crate::domain::operation::{BookOp, OperationState};
use crate::domain::page::PageState;
use crate::domain::toc::{
    EntryToFind, FinalizeGap, FinalizePatternResult, FinalizePhase, PatternAnalysisResult, TocEntry, TocInfo,
};
use crate::prompts::PromptSet;

/// LLM provider names configured for the book's operations
#[derive(Debug, Clone)]
pub struct BookProviders {
    pub blend: String,
    pub label: String,
    pub metadata: String,
    pub toc: String,
}

/// Running cost totals for the book
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CostTotals {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
    pub llm_calls: u64,
    pub ocr_calls: u64,
}

/// Bibliographic metadata extracted by the metadata op
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub publisher: Option<String>,
    pub year: Option<String>,
    pub language: Option<String>,
}

/// Partial pattern-analysis results while the three sub-units are in flight
#[derive(Debug, Default)]
struct PatternPartials {
    page_numbers: Option<Value>,
    chapter_patterns: Option<Value>,
    boundaries_dispatched: bool,
}

#[derive(Debug, Default)]
struct OpTable {
    metadata: OperationState,
    toc_finder: OperationState,
    toc_extract: OperationState,
    toc_link: OperationState,
    toc_finalize: OperationState,
    pattern_analysis: OperationState,
    structure: OperationState,
}

impl OpTable {
    fn get_mut(&mut self, op: BookOp) -> &mut OperationState {
        match op {
            BookOp::Metadata => &mut self.metadata,
            BookOp::TocFinder => &mut self.toc_finder,
            BookOp::TocExtract => &mut self.toc_extract,
            BookOp::TocLink => &mut self.toc_link,
            BookOp::TocFinalize => &mut self.toc_finalize,
            BookOp::PatternAnalysis => &mut self.pattern_analysis,
            BookOp::Structure => &mut self.structure,
        }
    }

    fn get(&self, op: BookOp) -> OperationState {
        match op {
            BookOp::Metadata => self.metadata,
            BookOp::TocFinder => self.toc_finder,
            BookOp::TocExtract => self.toc_extract,
            BookOp::TocLink => self.toc_link,
            BookOp::TocFinalize => self.toc_finalize,
            BookOp::PatternAnalysis => self.pattern_analysis,
            BookOp::Structure => self.structure,
        }
    }
}

/// Root aggregate for one book
pub struct BookState {
    book_id: String,
    book_doc_id: String,
    pdf_path: PathBuf,
    total_pages: u32,
    ocr_providers: Vec<String>,
    providers: BookProviders,
    prompts: PromptSet,

    pages: RwLock<BTreeMap<u32, PageState>>,
    ops: RwLock<OpTable>,
    toc: RwLock<TocInfo>,
    entries: RwLock<Vec<TocEntry>>,
    pattern: RwLock<Option<PatternAnalysisResult>>,
    pattern_partials: Mutex<PatternPartials>,
    finalize_phase: RwLock<FinalizePhase>,
    finalize_pattern: RwLock<Option<FinalizePatternResult>>,
    entries_to_find: RwLock<Vec<EntryToFind>>,
    gaps: RwLock<Vec<FinalizeGap>>,
    chapters: RwLock<Vec<ChapterState>>,
    agent_states: RwLock<HashMap<String, AgentState>>,
    metadata: RwLock<Option<BookMetadata>>,
    costs: Mutex<CostTotals>,
}

impl BookState {
    /// Create a fresh aggregate; `load_book` fills in persisted state
    pub fn new(
        book_id: impl Into<String>,
        book_doc_id: impl Into<String>,
        pdf_path: PathBuf,
        total_pages: u32,
        ocr_providers: Vec<String>,
        providers: BookProviders,
        prompts: PromptSet,
    ) -> Self {
        Self {
            book_id: book_id.into(),
            book_doc_id: book_doc_id.into(),
            pdf_path,
            total_pages,
            ocr_providers,
            providers,
            prompts,
            pages: RwLock::new(BTreeMap::new()),
            ops: RwLock::new(OpTable::default()),
            toc: RwLock::new(TocInfo::default()),
            entries: RwLock::new(Vec::new()),
            pattern: RwLock::new(None),
            pattern_partials: Mutex::new(PatternPartials::default()),
            finalize_phase: RwLock::new(FinalizePhase::NotStarted),
            finalize_pattern: RwLock::new(None),
            entries_to_find: RwLock::new(Vec::new()),
            gaps: RwLock::new(Vec::new()),
            chapters: RwLock::new(Vec::new()),
            agent_states: RwLock::new(HashMap::new()),
            metadata: RwLock::new(None),
            costs: Mutex::new(CostTotals::default()),
        }
    }

    // === Identity ===

    pub fn book_id(&self) -> &str {
        &self.book_id
    }

    pub fn book_doc_id(&self) -> &str {
        &self.book_doc_id
    }

    pub fn pdf_path(&self) -> &Path {
        &self.pdf_path
    }

    pub fn total_pages(&self) -> u32 {
        self.total_pages
    }

    pub fn ocr_providers(&self) -> &[String] {
        &self.ocr_providers
    }

    pub fn providers(&self) -> &BookProviders {
        &self.providers
    }

    pub fn prompts(&self) -> &PromptSet {
        &self.prompts
    }

    // === Pages ===

    /// Ensure a page record exists; idempotent
    pub fn get_or_create_page(&self, page: u32) {
        let mut pages = self.pages.write().expect("pages lock poisoned");
        pages.entry(page).or_insert_with(|| PageState::new(page));
    }

    /// Clone one page's state
    pub fn page(&self, page: u32) -> Option<PageState> {
        self.pages.read().expect("pages lock poisoned").get(&page).cloned()
    }

    /// Mutate one page through a closure; false if the page does not exist
    pub fn update_page<F>(&self, page: u32, f: F) -> bool
    where
        F: FnOnce(&mut PageState),
    {
        let mut pages = self.pages.write().expect("pages lock poisoned");
        match pages.get_mut(&page) {
            Some(state) => {
                f(state);
                true
            }
            None => false,
        }
    }

    /// Doc id of a page document
    pub fn page_doc_id(&self, page: u32) -> Option<String> {
        self.pages
            .read()
            .expect("pages lock poisoned")
            .get(&page)
            .and_then(|p| p.doc_id.clone())
    }

    /// Clone all pages in order (agent tools, chapter merge)
    pub fn pages_snapshot(&self) -> Vec<PageState> {
        self.pages.read().expect("pages lock poisoned").values().cloned().collect()
    }

    pub fn labeled_count(&self) -> u32 {
        self.pages
            .read()
            .expect("pages lock poisoned")
            .values()
            .filter(|p| p.is_label_done())
            .count() as u32
    }

    pub fn all_pages_labeled(&self) -> bool {
        let pages = self.pages.read().expect("pages lock poisoned");
        pages.len() as u32 == self.total_pages && pages.values().all(|p| p.is_label_done())
    }

    pub fn all_pages_blended(&self) -> bool {
        let pages = self.pages.read().expect("pages lock poisoned");
        pages.len() as u32 == self.total_pages && pages.values().all(|p| p.is_blend_done())
    }

    /// Whether pages `1..=n` all have blend complete
    pub fn first_pages_blended(&self, n: u32) -> bool {
        let n = n.min(self.total_pages);
        let pages = self.pages.read().expect("pages lock poisoned");
        (1..=n).all(|p| pages.get(&p).is_some_and(|page| page.is_blend_done()))
    }

    /// Pages whose blend is done but label is not
    pub fn pages_awaiting_label(&self) -> Vec<u32> {
        self.pages
            .read()
            .expect("pages lock poisoned")
            .values()
            .filter(|p| p.is_blend_done() && !p.is_label_done())
            .map(|p| p.page)
            .collect()
    }

    // === Operations ===

    pub fn op(&self, op: BookOp) -> OperationState {
        self.ops.read().expect("ops lock poisoned").get(op)
    }

    /// Mutate an operation state through a closure
    pub fn with_op<F, R>(&self, op: BookOp, f: F) -> R
    where
        F: FnOnce(&mut OperationState) -> R,
    {
        let mut ops = self.ops.write().expect("ops lock poisoned");
        f(ops.get_mut(op))
    }

    /// Replace an operation state wholesale (book loading)
    pub fn set_op(&self, op: BookOp, state: OperationState) {
        let mut ops = self.ops.write().expect("ops lock poisoned");
        *ops.get_mut(op) = state;
    }

    // === ToC ===

    pub fn toc(&self) -> TocInfo {
        self.toc.read().expect("toc lock poisoned").clone()
    }

    pub fn set_toc(&self, info: TocInfo) {
        *self.toc.write().expect("toc lock poisoned") = info;
    }

    pub fn toc_found(&self) -> bool {
        self.toc.read().expect("toc lock poisoned").found
    }

    pub fn entries(&self) -> Vec<TocEntry> {
        self.entries.read().expect("entries lock poisoned").clone()
    }

    pub fn set_entries(&self, entries: Vec<TocEntry>) {
        *self.entries.write().expect("entries lock poisoned") = entries;
    }

    /// Entries already pointing at a page document
    pub fn linked_entries(&self) -> Vec<TocEntry> {
        self.entries
            .read()
            .expect("entries lock poisoned")
            .iter()
            .filter(|e| e.is_linked())
            .cloned()
            .collect()
    }

    /// Entries still awaiting a link
    pub fn unlinked_entries(&self) -> Vec<TocEntry> {
        self.entries
            .read()
            .expect("entries lock poisoned")
            .iter()
            .filter(|e| !e.is_linked())
            .cloned()
            .collect()
    }

    /// Mutate an entry by doc id; false if absent
    pub fn update_entry<F>(&self, doc_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut TocEntry),
    {
        let mut entries = self.entries.write().expect("entries lock poisoned");
        match entries.iter_mut().find(|e| e.doc_id == doc_id) {
            Some(entry) => {
                f(entry);
                true
            }
            None => false,
        }
    }

    /// Insert or replace an entry by unique key
    pub fn upsert_entry(&self, entry: TocEntry) {
        let mut entries = self.entries.write().expect("entries lock poisoned");
        match entries.iter_mut().find(|e| e.unique_key == entry.unique_key) {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
    }

    // === Pattern analysis ===

    pub fn pattern(&self) -> Option<PatternAnalysisResult> {
        self.pattern.read().expect("pattern lock poisoned").clone()
    }

    pub fn set_pattern(&self, result: PatternAnalysisResult) {
        *self.pattern.write().expect("pattern lock poisoned") = Some(result);
    }

    pub fn pattern_complete(&self) -> bool {
        self.op(BookOp::PatternAnalysis).is_complete()
    }

    /// Body page range from pattern analysis, when known
    pub fn body_range(&self) -> Option<(u32, u32)> {
        let pattern = self.pattern.read().expect("pattern lock poisoned");
        pattern
            .as_ref()
            .and_then(|p| Some((p.body_start?, p.body_end?)))
    }

    /// Record a pattern sub-result; returns (both_prereqs_in, boundaries_already_dispatched)
    pub fn record_pattern_partial(&self, subtype: super::work::PatternSubtype, value: Value) -> (bool, bool) {
        let mut partials = self.pattern_partials.lock().expect("pattern partials poisoned");
        match subtype {
            super::work::PatternSubtype::PageNumbers => partials.page_numbers = Some(value),
            super::work::PatternSubtype::ChapterPatterns => partials.chapter_patterns = Some(value),
            super::work::PatternSubtype::BodyBoundaries => {}
        }
        (
            partials.page_numbers.is_some() && partials.chapter_patterns.is_some(),
            partials.boundaries_dispatched,
        )
    }

    /// Mark the boundaries sub-unit as dispatched
    pub fn mark_boundaries_dispatched(&self) {
        self.pattern_partials
            .lock()
            .expect("pattern partials poisoned")
            .boundaries_dispatched = true;
    }

    /// The two prerequisite partials, once both are present
    pub fn pattern_partials(&self) -> Option<(Value, Value)> {
        let partials = self.pattern_partials.lock().expect("pattern partials poisoned");
        Some((partials.page_numbers.clone()?, partials.chapter_patterns.clone()?))
    }

    /// Clear partial results so a failed pattern attempt restarts clean
    pub fn reset_pattern_partials(&self) {
        *self.pattern_partials.lock().expect("pattern partials poisoned") = PatternPartials::default();
    }

    // === Finalize ===

    pub fn finalize_phase(&self) -> FinalizePhase {
        *self.finalize_phase.read().expect("finalize lock poisoned")
    }

    pub fn set_finalize_phase(&self, phase: FinalizePhase) {
        *self.finalize_phase.write().expect("finalize lock poisoned") = phase;
    }

    pub fn finalize_pattern(&self) -> Option<FinalizePatternResult> {
        self.finalize_pattern.read().expect("finalize lock poisoned").clone()
    }

    pub fn set_finalize_pattern(&self, result: FinalizePatternResult) {
        *self.finalize_pattern.write().expect("finalize lock poisoned") = Some(result);
    }

    pub fn entries_to_find(&self) -> Vec<EntryToFind> {
        self.entries_to_find.read().expect("finalize lock poisoned").clone()
    }

    pub fn set_entries_to_find(&self, entries: Vec<EntryToFind>) {
        *self.entries_to_find.write().expect("finalize lock poisoned") = entries;
    }

    pub fn gaps(&self) -> Vec<FinalizeGap> {
        self.gaps.read().expect("finalize lock poisoned").clone()
    }

    pub fn set_gaps(&self, gaps: Vec<FinalizeGap>) {
        *self.gaps.write().expect("finalize lock poisoned") = gaps;
    }

    // === Chapters ===

    pub fn chapters(&self) -> Vec<ChapterState> {
        self.chapters.read().expect("chapters lock poisoned").clone()
    }

    pub fn set_chapters(&self, chapters: Vec<ChapterState>) {
        *self.chapters.write().expect("chapters lock poisoned") = chapters;
    }

    /// Mutate a chapter by unique key; false if absent
    pub fn update_chapter<F>(&self, unique_key: &str, f: F) -> bool
    where
        F: FnOnce(&mut ChapterState),
    {
        let mut chapters = self.chapters.write().expect("chapters lock poisoned");
        match chapters.iter_mut().find(|c| c.unique_key == unique_key) {
            Some(chapter) => {
                f(chapter);
                true
            }
            None => false,
        }
    }

    // === Agent states ===

    /// Save a checkpoint under `{agent_type}:{instance_key}`
    pub fn save_agent_state(&self, state: AgentState) {
        let key = format!("{}:{}", state.agent_type.name(), state.instance_key);
        self.agent_states
            .write()
            .expect("agent states lock poisoned")
            .insert(key, state);
    }

    /// Saved checkpoint for `(agent_type, instance_key)`, if any
    pub fn agent_state(&self, agent_type: crate::agent::AgentType, instance_key: &str) -> Option<AgentState> {
        let key = format!("{}:{instance_key}", agent_type.name());
        self.agent_states
            .read()
            .expect("agent states lock poisoned")
            .get(&key)
            .cloned()
    }

    pub fn remove_agent_state(&self, agent_type: crate::agent::AgentType, instance_key: &str) {
        let key = format!("{}:{instance_key}", agent_type.name());
        self.agent_states
            .write()
            .expect("agent states lock poisoned")
            .remove(&key);
    }

    // === Metadata & costs ===

    pub fn metadata(&self) -> Option<BookMetadata> {
        self.metadata.read().expect("metadata lock poisoned").clone()
    }

    pub fn set_metadata(&self, metadata: BookMetadata) {
        *self.metadata.write().expect("metadata lock poisoned") = Some(metadata);
    }

    /// Accumulate cost from one completed unit
    pub fn add_cost(&self, tokens_in: u64, tokens_out: u64, cost_usd: f64, is_ocr: bool) {
        let mut costs = self.costs.lock().expect("costs lock poisoned");
        costs.tokens_in += tokens_in;
        costs.tokens_out += tokens_out;
        costs.cost_usd += cost_usd;
        if is_ocr {
            costs.ocr_calls += 1;
        } else {
            costs.llm_calls += 1;
        }
    }

    pub fn costs(&self) -> CostTotals {
        *self.costs.lock().expect("costs lock poisoned")
    }

    /// Replace cost totals wholesale (book loading)
    pub fn set_costs(&self, costs: CostTotals) {
        *self.costs.lock().expect("costs lock poisoned") = costs;
    }
}
