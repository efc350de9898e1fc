//! BookJob - the per-book state machine
//!
//! Start runs once per submission: persist the processing status, sweep
//! for crashed operations, make sure page documents exist, and emit the
//! first batch of units. Every completion flows through `on_complete`,
//! serialized by the scheduler, which routes to the stage handler and
//! applies the retry policy.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use docstore::{DocumentStore, WriteOp, WriteSink};
use eyre::Result;
use serde_json::{Value, json};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent::{AgentType, ToolLoopAgent};
use crate::config::EngineConfig;
use crate::domain::{BookOp, BookState, UnitKind, WorkResult, WorkUnit, WorkUnitInfo};
use crate::prompts::PromptSet;
use crate::scheduler::{Job, JobFactory, Scheduler};

use super::{BOOKS, PAGES, persist_critical};

/// Dependencies handed to the job
#[derive(Clone)]
pub struct JobServices {
    pub store: Arc<DocumentStore>,
    pub sink: WriteSink,
    pub engine: EngineConfig,
}

/// The per-book job
pub struct BookJob {
    pub(crate) job_id: String,
    pub(crate) state: Arc<BookState>,
    pub(crate) services: JobServices,

    /// One registration per in-flight unit id
    pub(crate) units: std::sync::Mutex<HashMap<Uuid, WorkUnitInfo>>,

    /// Live agent drivers keyed by (type, instance key)
    pub(crate) agents: AsyncMutex<HashMap<(AgentType, String), ToolLoopAgent>>,

    /// Per-entry / per-gap agent retry counters
    pub(crate) agent_retries: std::sync::Mutex<HashMap<String, u32>>,

    pub(crate) done: AtomicBool,
    pub(crate) failed: AtomicBool,
}

impl BookJob {
    pub fn new(state: Arc<BookState>, services: JobServices) -> Self {
        let job_id = format!("book:{}", state.book_id());
        Self {
            job_id,
            state,
            services,
            units: std::sync::Mutex::new(HashMap::new()),
            agents: AsyncMutex::new(HashMap::new()),
            agent_retries: std::sync::Mutex::new(HashMap::new()),
            done: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        }
    }

    /// Register an in-flight unit
    pub(crate) fn register_unit(&self, unit: &WorkUnit, info: WorkUnitInfo) {
        let mut units = self.units.lock().expect("units lock poisoned");
        debug_assert!(!units.contains_key(&unit.id), "unit id registered twice");
        units.insert(unit.id, info);
    }

    /// Whether any in-flight unit has the given kind
    pub(crate) fn has_inflight(&self, kind: UnitKind) -> bool {
        self.units
            .lock()
            .expect("units lock poisoned")
            .values()
            .any(|info| info.kind == kind)
    }

    /// Count of registered units (tests)
    pub fn inflight_count(&self) -> usize {
        self.units.lock().expect("units lock poisoned").len()
    }

    /// Bump and read the retry counter for a link/finalize key
    pub(crate) fn bump_agent_retry(&self, key: &str) -> u32 {
        let mut retries = self.agent_retries.lock().expect("retries lock poisoned");
        let counter = retries.entry(key.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Fail a book op, persist its fields, and re-guard the start gates
    ///
    /// Demotion to NotStarted lets the next `maybe_start_book_operations`
    /// re-attempt; a terminal failure is permanent but does not block
    /// completion.
    pub(crate) async fn fail_book_op(&self, op: BookOp) -> Result<Vec<WorkUnit>> {
        let mut copy = self.state.op(op);
        let status = copy.fail(self.services.engine.max_book_op_retries);
        warn!(book_id = %self.state.book_id(), op = %op, ?status, retries = copy.retries(), "Book op failed");

        persist_critical(
            &self.services.sink,
            WriteOp::update(BOOKS, self.state.book_doc_id(), copy.to_fields(op.name())),
            "book op failure",
        )
        .await?;
        self.state.set_op(op, copy);

        if op == BookOp::PatternAnalysis {
            self.state.reset_pattern_partials();
        }

        self.maybe_start_book_operations().await
    }

    /// Persist the book status field synchronously
    pub(crate) async fn persist_status(&self, status: &str) -> Result<()> {
        persist_critical(
            &self.services.sink,
            WriteOp::update(BOOKS, self.state.book_doc_id(), json!({"status": status})),
            "book status",
        )
        .await?;
        Ok(())
    }

    /// Crash recovery sweep: every op that is InProgress with no live
    /// driver either restores from saved agent state or fails back to
    /// NotStarted for a clean re-attempt
    async fn recovery_sweep(&self) -> Result<Vec<WorkUnit>> {
        let mut units = Vec::new();

        for op in BookOp::all() {
            if !self.state.op(op).is_started() {
                continue;
            }
            info!(book_id = %self.state.book_id(), op = %op, "Recovering in-progress op");

            match op {
                BookOp::TocFinder => units.extend(self.resume_toc_finder().await?),
                BookOp::TocLink => units.extend(self.start_link_agents().await?),
                BookOp::TocFinalize => units.extend(self.enter_finalize_phase().await?),
                BookOp::Structure => units.extend(self.advance_structure().await?),
                // Single-call ops restart from scratch
                BookOp::Metadata | BookOp::TocExtract | BookOp::PatternAnalysis => {
                    units.extend(self.fail_book_op(op).await?);
                }
            }
        }

        Ok(units)
    }

    /// Make sure every page has a record in memory and a page document in
    /// the store
    async fn ensure_page_docs(&self) -> Result<()> {
        for page in 1..=self.state.total_pages() {
            self.state.get_or_create_page(page);

            if self.state.page_doc_id(page).is_none() {
                let receipt = self
                    .services
                    .sink
                    .send_sync(WriteOp::upsert_doc(
                        PAGES,
                        format!("{}:page:{page}", self.state.book_id()),
                        json!({
                            "book_id": self.state.book_id(),
                            "page": page,
                        }),
                    ))
                    .await?;
                self.state.update_page(page, |p| p.doc_id = Some(receipt.doc_id.clone()));
            }
        }
        Ok(())
    }

    /// Terminal-state check; sets the done flag once the completion
    /// conditions hold and the status persist commits
    pub(crate) async fn check_completion(&self) -> Result<()> {
        if self.done.load(Ordering::SeqCst) || self.failed.load(Ordering::SeqCst) {
            return Ok(());
        }

        if !self.state.all_pages_labeled() {
            return Ok(());
        }

        let state = &self.state;
        let ops_done = state.op(BookOp::Metadata).is_done()
            && state.op(BookOp::TocFinder).is_done()
            && (!state.toc_found() || state.op(BookOp::TocExtract).is_done())
            && state.op(BookOp::PatternAnalysis).is_done()
            && (!state.op(BookOp::TocExtract).is_complete() || state.op(BookOp::TocLink).is_done())
            && (!state.op(BookOp::TocLink).is_complete() || state.op(BookOp::TocFinalize).is_done())
            && (!state.op(BookOp::TocFinalize).is_complete() || state.op(BookOp::Structure).is_done());

        if !ops_done {
            return Ok(());
        }

        let costs = state.costs();
        let persisted = persist_critical(
            &self.services.sink,
            WriteOp::update(
                BOOKS,
                state.book_doc_id(),
                json!({
                    "status": "complete",
                    "tokens_in": costs.tokens_in,
                    "tokens_out": costs.tokens_out,
                    "cost_usd": costs.cost_usd,
                }),
            ),
            "book completion",
        )
        .await;

        match persisted {
            Ok(_) => {
                info!(book_id = %state.book_id(), cost_usd = costs.cost_usd, "Book complete");
                self.done.store(true, Ordering::SeqCst);
            }
            Err(e) => {
                // Stay not-done; a later completion check will retry
                error!(book_id = %state.book_id(), error = %e, "Completion persist failed, rolling back");
            }
        }

        Ok(())
    }

    /// Terminal failure: a page exhausted its retry budget and the book
    /// can never finish labeling
    pub(crate) async fn fail_job(&self, reason: &str) -> Result<()> {
        error!(book_id = %self.state.book_id(), reason, "Book job failed");
        self.persist_status("failed").await?;
        self.failed.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Failure branch: retry page units, fail book ops, apply per-entry
    /// budgets to link/finalize agents
    async fn handle_failure(&self, info: &WorkUnitInfo, error: Option<&str>) -> Result<Vec<WorkUnit>> {
        let error = error.unwrap_or("unknown error");

        if info.kind.is_page_level() {
            let page = info.page.unwrap_or(0);
            if info.retry_count < self.services.engine.max_page_op_retries {
                debug!(
                    book_id = %self.state.book_id(),
                    page,
                    kind = ?info.kind,
                    retry = info.retry_count + 1,
                    error,
                    "Retrying page unit"
                );
                return self.rebuild_page_unit(info.retry());
            }
            self.fail_job(&format!(
                "page {page} {} failed after {} attempts: {error}",
                info.kind.stage(),
                info.retry_count + 1
            ))
            .await?;
            return Ok(Vec::new());
        }

        match info.kind {
            UnitKind::Metadata => self.fail_book_op(BookOp::Metadata).await,
            UnitKind::TocExtract => self.fail_book_op(BookOp::TocExtract).await,
            UnitKind::PatternAnalysis => self.fail_book_op(BookOp::PatternAnalysis).await,
            UnitKind::FinalizePattern => self.fail_book_op(BookOp::TocFinalize).await,
            UnitKind::StructureClassify | UnitKind::StructureMerge => self.fail_book_op(BookOp::Structure).await,

            UnitKind::TocFinder => {
                self.drop_agent(AgentType::TocFinder, crate::agent::toc_finder::INSTANCE_KEY)
                    .await;
                self.fail_book_op(BookOp::TocFinder).await
            }

            UnitKind::TocLink => {
                let entry_doc_id = info.entry_doc_id.clone().unwrap_or_default();
                self.retry_link_entry(&entry_doc_id).await
            }

            UnitKind::FinalizeDiscover => {
                let key = info.finalize_key.clone().unwrap_or_default();
                self.retry_discover_entry(&key).await
            }

            UnitKind::FinalizeValidate => {
                let key = info.finalize_key.clone().unwrap_or_default();
                self.retry_gap(&key).await
            }

            UnitKind::StructurePolish => self.retry_polish(info).await,

            UnitKind::Extract | UnitKind::Ocr | UnitKind::Blend | UnitKind::Label => unreachable!("page level"),
        }
    }

    /// Remove an agent driver, if present
    pub(crate) async fn drop_agent(&self, agent_type: AgentType, key: &str) {
        self.agents.lock().await.remove(&(agent_type, key.to_string()));
    }
}

#[async_trait]
impl Job for BookJob {
    fn id(&self) -> &str {
        &self.job_id
    }

    fn job_type(&self) -> &'static str {
        "book"
    }

    fn record_payload(&self) -> Value {
        json!({"book_id": self.state.book_id()})
    }

    async fn start(&self) -> Result<Vec<WorkUnit>> {
        let state = &self.state;
        info!(book_id = %state.book_id(), total_pages = state.total_pages(), "Starting book job");

        self.persist_status("processing").await?;

        let mut units = self.recovery_sweep().await?;
        self.ensure_page_docs().await?;

        for page in 1..=state.total_pages() {
            let record = state.page(page).expect("page created above");
            if !record.extract_done {
                units.push(self.extract_unit(page));
            } else {
                units.extend(self.generate_page_work_units(page)?);
            }
        }

        units.extend(self.maybe_start_book_operations().await?);

        self.check_completion().await?;
        Ok(units)
    }

    async fn on_complete(&self, result: WorkResult) -> Result<Vec<WorkUnit>> {
        if self.is_done().await {
            self.units
                .lock()
                .expect("units lock poisoned")
                .remove(&result.unit_id);
            return Ok(Vec::new());
        }

        let info = {
            let units = self.units.lock().expect("units lock poisoned");
            units.get(&result.unit_id).cloned()
        };

        let Some(info) = info else {
            // Duplicate or foreign completion
            debug!(unit_id = %result.unit_id, "Ignoring unknown work unit");
            return Ok(Vec::new());
        };

        self.state.add_cost(
            result.usage.input_tokens,
            result.usage.output_tokens,
            result.cost_usd,
            info.kind == UnitKind::Ocr,
        );

        let outcome = if !result.success {
            if result.cancelled {
                debug!(unit_id = %result.unit_id, "Unit cancelled, no retry");
                Ok(Vec::new())
            } else {
                self.handle_failure(&info, result.error.as_deref()).await
            }
        } else {
            match self.dispatch_handler(&info, &result).await {
                Ok(units) => Ok(units),
                Err(e) => {
                    warn!(
                        book_id = %self.state.book_id(),
                        kind = ?info.kind,
                        error = %e,
                        "Handler error"
                    );
                    let message = e.to_string();
                    self.handle_failure(&info, Some(message.as_str())).await
                }
            }
        };

        // The registration goes before any new units are returned
        self.units
            .lock()
            .expect("units lock poisoned")
            .remove(&result.unit_id);

        let mut units = outcome?;
        // Re-check the gated starts; guards make this idempotent
        units.extend(self.maybe_start_book_operations().await?);
        self.check_completion().await?;
        Ok(units)
    }

    async fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst) || self.failed.load(Ordering::SeqCst)
    }
}

/// Factory for resuming book jobs from their records
pub fn book_job_factory(services: JobServices, prompts: PromptSet, _scheduler: Scheduler) -> JobFactory {
    Arc::new(move |record| {
        let services = services.clone();
        let prompts = prompts.clone();
        Box::pin(async move {
            let book_id = record.payload["book_id"]
                .as_str()
                .ok_or_else(|| eyre::eyre!("job record missing book_id"))?
                .to_string();

            let state = super::load_book(&services.store, &services.engine, prompts, &book_id).await?;
            Ok(Arc::new(BookJob::new(state, services)) as Arc<dyn Job>)
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BookProviders;
    use docstore::DocumentStore;
    use std::path::PathBuf;

    fn broken_doc_job() -> BookJob {
        // The book doc id points nowhere, so every critical persist fails
        let state = Arc::new(BookState::new(
            "b1",
            "no-such-doc",
            PathBuf::from("/tmp/book.pdf"),
            2,
            vec!["engA".to_string()],
            BookProviders {
                blend: "fake".to_string(),
                label: "fake".to_string(),
                metadata: "fake".to_string(),
                toc: "fake".to_string(),
            },
            PromptSet::embedded(),
        ));

        let store = Arc::new(DocumentStore::open_in_memory().unwrap());
        let services = JobServices {
            store: store.clone(),
            sink: WriteSink::spawn(store),
            engine: EngineConfig::default(),
        };
        BookJob::new(state, services)
    }

    #[tokio::test]
    async fn test_failed_completion_persist_rolls_back() {
        // The op flips to Complete in memory only after the persist
        // commits; a persist failure leaves it InProgress so downstream
        // ops cannot start
        let job = broken_doc_job();
        job.state.with_op(BookOp::TocFinalize, |op| {
            op.start();
        });

        let result = job.complete_book_op(BookOp::TocFinalize, serde_json::json!({})).await;
        assert!(result.is_err());
        assert!(!job.state.op(BookOp::TocFinalize).is_complete());
        assert!(job.state.op(BookOp::TocFinalize).is_started());

        // The structure gate reads the completed flag, so it stays shut
        assert!(!job.state.op(BookOp::TocFinalize).is_complete());
        assert!(job.state.op(BookOp::Structure).can_start());
    }

    #[tokio::test]
    async fn test_unknown_unit_is_ignored() {
        let job = broken_doc_job();
        let result = WorkResult::failed(Uuid::new_v4(), "stray");
        let units = job.on_complete(result).await.unwrap();
        assert!(units.is_empty());
        assert_eq!(job.inflight_count(), 0);
    }

    #[tokio::test]
    async fn test_completion_persist_failure_keeps_job_running() {
        // check_completion must not set the done flag when the status
        // write cannot commit
        let job = broken_doc_job();
        for page in 1..=2 {
            job.state.get_or_create_page(page);
            job.state.update_page(page, |p| {
                p.extract_done = true;
                p.blended_text = Some("text".to_string());
                p.label = Some(Default::default());
            });
        }
        for op in BookOp::all() {
            job.state.with_op(op, |state| {
                state.start();
                state.complete();
            });
        }
        job.state.set_toc(crate::domain::TocInfo {
            doc_id: None,
            found: false,
            start_page: None,
            end_page: None,
        });

        job.check_completion().await.unwrap();
        assert!(!job.is_done().await);
    }
}
