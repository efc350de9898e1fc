//! Scheduler implementation
//!
//! Accepts jobs, persists job records, dispatches work units to the pool
//! matching their type + provider, and hands results back to the job's
//! completion handler. `on_complete` calls for one job are serialized by
//! the job's lock; no ordering is implied between units of the same job.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use docstore::{DocumentStore, Filter, WriteOp, WriteSink};
use futures::FutureExt;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use crate::domain::{CpuOutcome, CpuTask, WorkOutcome, WorkPayload, WorkResult, WorkUnit};
use crate::job::structure::merge_chapter_text;
use crate::metrics::emit_metric;
use crate::providers::{PageExtractor, ProviderRegistry};

use super::pool::{PoolConfig, WorkerPool};

/// Collection job records live in
pub const JOBS_COLLECTION: &str = "jobs";

/// Scheduler errors
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("provider missing: {provider}")]
    ProviderMissing { provider: String },

    #[error("job already active: {job_id}")]
    JobActive { job_id: String },

    #[error("no factory registered for job type {job_type}")]
    FactoryMissing { job_type: String },
}

/// A schedulable job
///
/// `start` is invoked once per submission; `on_complete` once per finished
/// unit, never concurrently for the same job.
#[async_trait]
pub trait Job: Send + Sync {
    fn id(&self) -> &str;

    fn job_type(&self) -> &'static str;

    /// Payload persisted in the job record, enough for a factory to
    /// rebuild the job after a restart
    fn record_payload(&self) -> Value;

    async fn start(&self) -> eyre::Result<Vec<WorkUnit>>;

    async fn on_complete(&self, result: WorkResult) -> eyre::Result<Vec<WorkUnit>>;

    async fn is_done(&self) -> bool;
}

/// Persisted job record
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub job_id: String,
    pub job_type: String,
    pub status: String,
    pub payload: Value,
}

impl JobRecord {
    fn from_doc(doc: &docstore::Document) -> Self {
        Self {
            job_id: doc.str_field("job_id").unwrap_or_default().to_string(),
            job_type: doc.str_field("job_type").unwrap_or_default().to_string(),
            status: doc.str_field("status").unwrap_or_default().to_string(),
            payload: doc.body.get("payload").cloned().unwrap_or(Value::Null),
        }
    }
}

/// Factory rebuilding a job from its persisted record
pub type JobFactory =
    Arc<dyn Fn(JobRecord) -> Pin<Box<dyn Future<Output = eyre::Result<Arc<dyn Job>>> + Send>> + Send + Sync>;

/// Per-job runtime handle
#[derive(Clone)]
struct JobHandle {
    job: Arc<dyn Job>,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
    /// Serializes start and every on_complete for this job
    complete_lock: Arc<Mutex<()>>,
}

/// The scheduler: a cheap handle over shared state, clone freely
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    registry: Arc<ProviderRegistry>,
    extractor: Arc<dyn PageExtractor>,
    store: Arc<DocumentStore>,
    sink: WriteSink,
    pools: HashMap<String, Arc<WorkerPool>>,
    jobs: Mutex<HashMap<String, JobHandle>>,
    factories: std::sync::Mutex<HashMap<String, JobFactory>>,
}

impl Scheduler {
    /// Build pools from the registry and create the scheduler
    pub fn new(
        registry: Arc<ProviderRegistry>,
        extractor: Arc<dyn PageExtractor>,
        store: Arc<DocumentStore>,
        sink: WriteSink,
        cpu_pool_size: Option<usize>,
    ) -> Self {
        let mut pools = HashMap::new();

        for (name, limits) in registry.llm_providers() {
            pools.insert(
                format!("llm:{name}"),
                WorkerPool::new(PoolConfig {
                    name: format!("llm:{name}"),
                    max_in_flight: limits.max_concurrent,
                    max_requests_per_window: limits.max_requests_per_window,
                    rate_window_secs: limits.rate_window_secs,
                }),
            );
        }

        for (name, limits) in registry.ocr_providers() {
            pools.insert(
                format!("ocr:{name}"),
                WorkerPool::new(PoolConfig {
                    name: format!("ocr:{name}"),
                    max_in_flight: limits.max_concurrent,
                    max_requests_per_window: limits.max_requests_per_window,
                    rate_window_secs: limits.rate_window_secs,
                }),
            );
        }

        let cpu_size = cpu_pool_size.unwrap_or_else(|| {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
        });
        pools.insert("cpu".to_string(), WorkerPool::new(PoolConfig::cpu(cpu_size)));

        Self {
            inner: Arc::new(SchedulerInner {
                registry,
                extractor,
                store,
                sink,
                pools,
                jobs: Mutex::new(HashMap::new()),
                factories: std::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register a factory for a job type, used by `resume`
    pub fn register_factory(&self, job_type: impl Into<String>, factory: JobFactory) {
        self.inner.factories
            .lock()
            .expect("factories lock poisoned")
            .insert(job_type.into(), factory);
    }

    /// Submit a job: persist its record, start it, dispatch initial units
    pub async fn submit(&self, job: Arc<dyn Job>) -> eyre::Result<()> {
        let job_id = job.id().to_string();

        let handle = {
            let mut jobs = self.inner.jobs.lock().await;
            if jobs.contains_key(&job_id) {
                return Err(SchedulerError::JobActive { job_id }.into());
            }

            let (cancel_tx, cancel_rx) = watch::channel(false);
            let handle = JobHandle {
                job: job.clone(),
                cancel_tx: Arc::new(cancel_tx),
                cancel_rx,
                complete_lock: Arc::new(Mutex::new(())),
            };
            jobs.insert(job_id.clone(), handle.clone());
            handle
        };

        self.inner.sink
            .send_sync(WriteOp::upsert_doc(
                JOBS_COLLECTION,
                job_record_key(&job_id),
                json!({
                    "job_id": job_id,
                    "job_type": job.job_type(),
                    "status": "running",
                    "payload": job.record_payload(),
                }),
            ))
            .await?;

        let started = {
            let _guard = handle.complete_lock.lock().await;
            handle.job.start().await
        };

        let units = match started {
            Ok(units) => units,
            Err(e) => {
                self.inner.jobs.lock().await.remove(&job_id);
                self.update_job_status(&job_id, "failed").await;
                return Err(e.wrap_err(format!("job {job_id} failed to start")));
            }
        };

        info!(job_id, units = units.len(), "Job started");
        self.dispatch(&handle, units);

        if handle.job.is_done().await {
            self.finish_job(&job_id).await;
        }

        Ok(())
    }

    /// Cancel a job; in-flight units complete as cancelled, nothing new
    /// dispatches
    pub async fn cancel(&self, job_id: &str) -> bool {
        let jobs = self.inner.jobs.lock().await;
        match jobs.get(job_id) {
            Some(handle) => {
                info!(job_id, "Cancelling job");
                let _ = handle.cancel_tx.send(true);
                true
            }
            None => false,
        }
    }

    /// Rebuild and resubmit every non-terminal job record
    pub async fn resume(&self) -> eyre::Result<usize> {
        let records = self.inner.store.query(JOBS_COLLECTION, &[Filter::eq("status", "running")])?;
        let mut resumed = 0;

        for doc in &records {
            let record = JobRecord::from_doc(doc);
            let factory = {
                let factories = self.inner.factories.lock().expect("factories lock poisoned");
                factories.get(&record.job_type).cloned()
            };

            let Some(factory) = factory else {
                warn!(job_id = %record.job_id, job_type = %record.job_type, "No factory for job type, skipping");
                continue;
            };

            let job_id = record.job_id.clone();
            match factory(record).await {
                Ok(job) => match self.submit(job).await {
                    Ok(()) => {
                        info!(job_id, "Resumed job");
                        resumed += 1;
                    }
                    Err(e) => warn!(job_id, error = %e, "Failed to resubmit job"),
                },
                Err(e) => warn!(job_id, error = %e, "Factory failed to rebuild job"),
            }
        }

        Ok(resumed)
    }

    /// Number of currently registered jobs
    pub async fn active_jobs(&self) -> usize {
        self.inner.jobs.lock().await.len()
    }

    fn dispatch(&self, handle: &JobHandle, units: Vec<WorkUnit>) {
        for unit in units {
            if *handle.cancel_rx.borrow() {
                debug!(unit_id = %unit.id, "Job cancelled, dropping unit");
                continue;
            }

            let scheduler = self.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                scheduler.run_unit(handle, unit).await;
            });
        }
    }

    async fn run_unit(&self, handle: JobHandle, unit: WorkUnit) {
        let started = Instant::now();
        let mut cancel_rx = handle.cancel_rx.clone();

        let mut result = if *cancel_rx.borrow() {
            WorkResult::cancelled(unit.id)
        } else {
            tokio::select! {
                _ = cancel_rx.changed() => WorkResult::cancelled(unit.id),
                result = self.execute_payload(&unit) => result,
            }
        };
        result.latency_ms = started.elapsed().as_millis() as u64;

        emit_metric(&self.inner.sink, &unit.metrics, &result, result.cost_usd).await;
        self.deliver(&handle, result).await;
    }

    async fn execute_payload(&self, unit: &WorkUnit) -> WorkResult {
        match &unit.payload {
            WorkPayload::Chat(request) => {
                let Some(client) = self.inner.registry.llm(&unit.provider) else {
                    return WorkResult::failed(
                        unit.id,
                        SchedulerError::ProviderMissing {
                            provider: unit.provider.clone(),
                        }
                        .to_string(),
                    );
                };
                let pool = &self.inner.pools[&format!("llm:{}", unit.provider)];
                let _permit = pool.admit().await;

                match client.complete((**request).clone()).await {
                    Ok(chat) => {
                        let usage = chat.usage;
                        let cost = usage.cost_usd(client.model());
                        let mut result = WorkResult::ok(unit.id, WorkOutcome::Chat(chat));
                        result.usage = usage;
                        result.cost_usd = cost;
                        result
                    }
                    Err(e) => WorkResult::failed(unit.id, e.to_string()),
                }
            }

            WorkPayload::Ocr { image_path } => {
                let Some(client) = self.inner.registry.ocr(&unit.provider) else {
                    return WorkResult::failed(
                        unit.id,
                        SchedulerError::ProviderMissing {
                            provider: unit.provider.clone(),
                        }
                        .to_string(),
                    );
                };
                let pool = &self.inner.pools[&format!("ocr:{}", unit.provider)];
                let _permit = pool.admit().await;

                match client.recognize(image_path).await {
                    Ok(output) => {
                        let cost = output.cost_usd;
                        let tokens = output.tokens;
                        let mut result = WorkResult::ok(unit.id, WorkOutcome::Ocr(output));
                        result.usage.output_tokens = tokens;
                        result.cost_usd = cost;
                        result
                    }
                    Err(e) => WorkResult::failed(unit.id, e.to_string()),
                }
            }

            WorkPayload::Cpu(task) => {
                let pool = &self.inner.pools["cpu"];
                let _permit = pool.admit().await;

                match task {
                    CpuTask::ExtractPage { pdf_path, page } => {
                        match self.inner.extractor.extract_page(pdf_path, *page).await {
                            Ok(extracted) => WorkResult::ok(
                                unit.id,
                                WorkOutcome::Cpu(CpuOutcome::PageExtracted {
                                    image_path: extracted.image_path,
                                    embedded_text: extracted.embedded_text,
                                }),
                            ),
                            Err(e) => WorkResult::failed(unit.id, e.to_string()),
                        }
                    }
                    CpuTask::MergeChapterText { chapter_key, pages } => {
                        let (text, word_count) = merge_chapter_text(pages);
                        WorkResult::ok(
                            unit.id,
                            WorkOutcome::Cpu(CpuOutcome::ChapterMerged {
                                chapter_key: chapter_key.clone(),
                                text,
                                word_count,
                            }),
                        )
                    }
                }
            }
        }
    }

    async fn deliver(&self, handle: &JobHandle, result: WorkResult) {
        let job_id = handle.job.id().to_string();
        let unit_id = result.unit_id;

        let follow_ups = {
            let _guard = handle.complete_lock.lock().await;
            match AssertUnwindSafe(handle.job.on_complete(result)).catch_unwind().await {
                Ok(Ok(units)) => units,
                Ok(Err(e)) => {
                    error!(job_id, %unit_id, error = %e, "Completion handler failed");
                    Vec::new()
                }
                Err(_) => {
                    error!(job_id, %unit_id, "Completion handler panicked; state unchanged, unit failed");
                    Vec::new()
                }
            }
        };

        self.dispatch(handle, follow_ups);

        if handle.job.is_done().await {
            self.finish_job(&job_id).await;
        }
    }

    async fn finish_job(&self, job_id: &str) {
        let removed = self.inner.jobs.lock().await.remove(job_id).is_some();
        if removed {
            info!(job_id, "Job done");
            self.update_job_status(job_id, "done").await;
        }
    }

    async fn update_job_status(&self, job_id: &str, status: &str) {
        let result = self
            .inner
            .sink
            .send_sync(WriteOp::Upsert {
                collection: JOBS_COLLECTION.to_string(),
                unique_key: job_record_key(job_id),
                create: json!({"job_id": job_id, "status": status}),
                patch: json!({"status": status}),
            })
            .await;

        if let Err(e) = result {
            warn!(job_id, status, error = %e, "Failed to update job record");
        }
    }
}

fn job_record_key(job_id: &str) -> String {
    format!("job:{job_id}")
}
