//! End-to-end engine tests
//!
//! Scripted fake LLM/OCR/extractor drivers and a real temp-backed store
//! drive whole book jobs through the scheduler. Scenarios follow the
//! book pipeline: a plain two-page book, transient OCR failures, finalize
//! discovery, failed completion persists, and crash resumption.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Value, json};

use bindery::agent::{AgentState, AgentType};
use bindery::config::EngineConfig;
use bindery::domain::WorkPayload;
use bindery::job::{BookJob, JobServices, create_book, load_book};
use bindery::llm::{ChatRequest, ChatResult, LlmClient, LlmError, Message, StopReason};
use bindery::ocr::{OcrClient, OcrError, OcrOutput};
use bindery::prompts::PromptSet;
use bindery::providers::{ExtractedPage, PageExtractor, ProviderLimits, ProviderRegistry};
use bindery::scheduler::{Job, Scheduler};
use docstore::{DocumentStore, Filter, WriteSink};

// === Scripted drivers ===

fn page_text(page: u32) -> String {
    format!("Heading {page}\nBody text of page {page} with several words.\n{page}")
}

/// Script controlling what the fake LLM answers per stage
#[derive(Default)]
struct LlmScript {
    /// ToC finder answer: located page range, or None for "no ToC"
    toc_range: Option<(u32, u32)>,

    /// ToC extract answer
    toc_entries: Vec<Value>,

    /// Entry finder answers by entry title
    entry_pages: HashMap<String, u32>,

    /// Chapter finder answers by identifier
    chapter_pages: HashMap<String, u32>,

    /// Finalize pattern answer
    finalize_pattern: Option<Value>,

    /// Body boundaries answer
    body: Option<(u32, u32)>,
}

struct FakeLlm {
    script: LlmScript,
    calls: Mutex<Vec<String>>,
}

impl FakeLlm {
    fn new(script: LlmScript) -> Arc<Self> {
        Arc::new(Self {
            script,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, stage: &str) -> usize {
        self.calls().iter().filter(|c| *c == stage).count()
    }

    fn answer(&self, stage: &str, request: &ChatRequest) -> Value {
        match stage {
            "blend" => json!({"blended_text": extract_blend_reading(request)}),
            "label" => json!({
                "page_label": null,
                "headings": [],
                "header": null,
                "footer": null,
                "is_toc_page": false,
            }),
            "metadata" => json!({"title": "A Test Book", "author": "An Author"}),
            "toc_find" => match self.script.toc_range {
                Some((start, end)) => json!({"found": true, "start_page": start, "end_page": end}),
                None => json!({"found": false}),
            },
            "toc_extract" => json!({"entries": self.script.toc_entries}),
            "entry_find" => {
                let title = quoted_title(request);
                match self.script.entry_pages.get(&title) {
                    Some(page) => json!({"found": true, "scan_page": page}),
                    None => json!({"found": false}),
                }
            }
            "chapter_find" => {
                let identifier = chapter_identifier(request);
                match self.script.chapter_pages.get(&identifier) {
                    Some(page) => json!({"found": true, "scan_page": page, "title": format!("Chapter {identifier}")}),
                    None => json!({"found": false}),
                }
            }
            "gap_investigate" => json!({"fix_type": "no_fix_needed"}),
            "pattern_page_numbers" => json!({"pattern": "arabic throughout"}),
            "pattern_chapters" => json!({"patterns": ["Chapter N"]}),
            "pattern_boundaries" => {
                let (start, end) = self.script.body.unwrap_or((1, 10_000));
                json!({"body_start": start, "body_end": end})
            }
            "finalize_pattern" => self
                .script
                .finalize_pattern
                .clone()
                .unwrap_or_else(|| json!({"patterns": [], "excluded": []})),
            "classify" => {
                let chapters: Vec<Value> = classify_keys(request)
                    .into_iter()
                    .map(|key| {
                        json!({
                            "key": key,
                            "matter_type": "body",
                            "content_type": "chapter",
                            "audio_include": true,
                        })
                    })
                    .collect();
                json!({"chapters": chapters})
            }
            "polish" => json!({"edits": []}),
            other => panic!("unscripted stage {other}"),
        }
    }
}

/// Which pipeline stage is this request? Schemas and system prompts are
/// distinctive enough to tell
fn classify_stage(request: &ChatRequest) -> &'static str {
    let schema = request.response_schema.as_ref().expect("engine always sets a schema");
    let props = &schema["properties"];
    let has = |key: &str| !props[key].is_null();

    if has("blended_text") {
        "blend"
    } else if has("is_toc_page") {
        "label"
    } else if has("entries") {
        "toc_extract"
    } else if has("author") {
        "metadata"
    } else if has("excluded") {
        "finalize_pattern"
    } else if has("pattern") {
        "pattern_page_numbers"
    } else if has("patterns") {
        "pattern_chapters"
    } else if has("body_start") {
        "pattern_boundaries"
    } else if has("chapters") {
        "classify"
    } else if has("edits") {
        "polish"
    } else if has("fix_type") {
        "gap_investigate"
    } else if has("found") {
        if request.system_prompt.contains("locate the table of contents") {
            "toc_find"
        } else if request.system_prompt.contains("one table-of-contents entry") {
            "entry_find"
        } else {
            "chapter_find"
        }
    } else {
        panic!("unrecognized request schema: {schema}")
    }
}

fn extract_blend_reading(request: &ChatRequest) -> String {
    let text = first_user_text(request);
    let mut lines = Vec::new();
    let mut in_reading = false;
    for line in text.lines() {
        if line.starts_with("=== Reading from") {
            in_reading = true;
            continue;
        }
        if line.starts_with("Record the blended") {
            break;
        }
        if in_reading {
            lines.push(line);
        }
    }
    lines.join("\n").trim().to_string()
}

fn first_user_text(request: &ChatRequest) -> String {
    match &request.messages[0].content {
        bindery::llm::MessageContent::Text(text) => text.clone(),
        bindery::llm::MessageContent::Blocks(_) => String::new(),
    }
}

fn quoted_title(request: &ChatRequest) -> String {
    let text = first_user_text(request);
    text.split('"').nth(1).unwrap_or_default().to_string()
}

fn chapter_identifier(request: &ChatRequest) -> String {
    // "... suggest a chapter numbered 2 should exist ..."
    let system = &request.system_prompt;
    system
        .split("numbered ")
        .nth(1)
        .and_then(|rest| rest.split_whitespace().next())
        .unwrap_or_default()
        .to_string()
}

fn classify_keys(request: &ChatRequest) -> Vec<String> {
    first_user_text(request)
        .lines()
        .filter_map(|line| {
            line.strip_prefix("=== ")
                .and_then(|rest| rest.strip_suffix(" ==="))
                .map(String::from)
        })
        .collect()
}

#[async_trait]
impl LlmClient for FakeLlm {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResult, LlmError> {
        let stage = classify_stage(&request);
        self.calls.lock().unwrap().push(stage.to_string());

        Ok(ChatResult {
            content: None,
            parsed_json: Some(self.answer(stage, &request)),
            tool_calls: Vec::new(),
            stop_reason: StopReason::ToolUse,
            usage: Default::default(),
        })
    }

    fn model(&self) -> &str {
        "fake-model"
    }
}

struct FakeOcr {
    attempts: Mutex<HashMap<u32, u32>>,
    /// Fail this page's first N attempts
    fail_page: Option<(u32, u32)>,
}

impl FakeOcr {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            attempts: Mutex::new(HashMap::new()),
            fail_page: None,
        })
    }

    fn failing(page: u32, times: u32) -> Arc<Self> {
        Arc::new(Self {
            attempts: Mutex::new(HashMap::new()),
            fail_page: Some((page, times)),
        })
    }

    fn attempts_for(&self, page: u32) -> u32 {
        self.attempts.lock().unwrap().get(&page).copied().unwrap_or(0)
    }
}

fn page_from_image(path: &Path) -> u32 {
    path.file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.strip_prefix("p"))
        .and_then(|s| s.parse().ok())
        .expect("fake image path encodes the page")
}

#[async_trait]
impl OcrClient for FakeOcr {
    async fn recognize(&self, image_path: &Path) -> Result<OcrOutput, OcrError> {
        let page = page_from_image(image_path);
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let counter = attempts.entry(page).or_insert(0);
            *counter += 1;
            *counter
        };

        if let Some((fail_page, times)) = self.fail_page
            && page == fail_page
            && attempt <= times
        {
            return Err(OcrError::ApiError {
                status: 503,
                message: "engine warming up".to_string(),
            });
        }

        Ok(OcrOutput {
            text: page_text(page),
            markdown: None,
            cost_usd: 0.001,
            tokens: 10,
        })
    }
}

struct FakeExtractor {
    total_pages: u32,
}

#[async_trait]
impl PageExtractor for FakeExtractor {
    async fn page_count(&self, _pdf_path: &Path) -> eyre::Result<u32> {
        Ok(self.total_pages)
    }

    async fn extract_page(&self, _pdf_path: &Path, page: u32) -> eyre::Result<ExtractedPage> {
        Ok(ExtractedPage {
            image_path: PathBuf::from(format!("/fake/p{page}.png")),
            embedded_text: None,
        })
    }
}

// === Harness ===

struct Harness {
    store: Arc<DocumentStore>,
    sink: WriteSink,
    scheduler: Scheduler,
    services: JobServices,
    prompts: PromptSet,
}

fn test_engine_config() -> EngineConfig {
    EngineConfig {
        ocr_providers: vec!["engA".to_string()],
        blend_provider: "fake".to_string(),
        label_provider: "fake".to_string(),
        metadata_provider: "fake".to_string(),
        toc_provider: "fake".to_string(),
        ..Default::default()
    }
}

fn build_harness(
    llm: Arc<FakeLlm>,
    ocr: Arc<FakeOcr>,
    total_pages: u32,
    engine: EngineConfig,
    store: Arc<DocumentStore>,
) -> Harness {
    let sink = WriteSink::spawn(store.clone());

    let mut registry = ProviderRegistry::new();
    registry.register_llm("fake", llm, ProviderLimits::default());
    registry.register_ocr("engA", ocr, ProviderLimits::default());

    let scheduler = Scheduler::new(
        Arc::new(registry),
        Arc::new(FakeExtractor { total_pages }),
        store.clone(),
        sink.clone(),
        Some(4),
    );

    let services = JobServices {
        store: store.clone(),
        sink: sink.clone(),
        engine,
    };

    Harness {
        store,
        sink,
        scheduler,
        services,
        prompts: PromptSet::embedded(),
    }
}

async fn run_book(harness: &Harness, book_id: &str, total_pages: u32) -> Arc<BookJob> {
    create_book(&harness.sink, book_id, Path::new("/fake/book.pdf"), total_pages)
        .await
        .unwrap();

    let state = load_book(&harness.store, &harness.services.engine, harness.prompts.clone(), book_id)
        .await
        .unwrap();
    let job = Arc::new(BookJob::new(state, harness.services.clone()));

    harness.scheduler.submit(job.clone()).await.unwrap();
    wait_for_idle(&harness.scheduler).await;
    job
}

async fn wait_for_idle(scheduler: &Scheduler) {
    let start = Instant::now();
    while scheduler.active_jobs().await > 0 {
        assert!(start.elapsed() < Duration::from_secs(30), "job did not finish");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn book_doc(store: &Arc<DocumentStore>, book_id: &str) -> docstore::Document {
    store.get_by_unique_key("books", book_id).unwrap().unwrap()
}

// === Two pages, one OCR engine, no ToC ===

#[tokio::test]
async fn two_page_book_without_toc() {
    let store = Arc::new(DocumentStore::open_in_memory().unwrap());
    let llm = FakeLlm::new(LlmScript {
        toc_range: None,
        body: Some((1, 2)),
        ..Default::default()
    });
    let ocr = FakeOcr::new();
    let harness = build_harness(llm.clone(), ocr.clone(), 2, test_engine_config(), store.clone());

    let job = run_book(&harness, "s1", 2).await;

    // Terminal state
    let book = book_doc(&store, "s1");
    assert_eq!(book.str_field("status"), Some("complete"));
    assert_eq!(book.bool_field("toc_found"), Some(false));
    assert_eq!(book.bool_field("toc_finder_complete"), Some(true));
    assert_eq!(book.bool_field("metadata_complete"), Some(true));
    assert_eq!(book.bool_field("pattern_analysis_complete"), Some(true));
    // No ToC means extract and link never start (their fields are never
    // even written)
    assert_ne!(book.bool_field("toc_extract_started"), Some(true));
    assert_ne!(book.bool_field("toc_link_started"), Some(true));

    // Unit counts
    assert_eq!(ocr.attempts_for(1), 1);
    assert_eq!(ocr.attempts_for(2), 1);
    assert_eq!(llm.count("blend"), 2);
    assert_eq!(llm.count("label"), 2);
    assert_eq!(llm.count("pattern_page_numbers"), 1);
    assert_eq!(llm.count("pattern_chapters"), 1);
    assert_eq!(llm.count("pattern_boundaries"), 1);
    assert_eq!(llm.count("metadata"), 1);
    assert_eq!(llm.count("toc_find"), 1);
    assert_eq!(llm.count("toc_extract"), 0);
    assert_eq!(llm.count("entry_find"), 0);

    // Gating order: boundaries after the other two pattern calls, labels
    // after boundaries
    let calls = llm.calls();
    let position = |stage: &str| calls.iter().position(|c| c == stage).unwrap();
    let boundaries = position("pattern_boundaries");
    assert!(boundaries > position("pattern_page_numbers"));
    assert!(boundaries > position("pattern_chapters"));
    for (index, call) in calls.iter().enumerate() {
        if call == "label" {
            assert!(index > boundaries, "label dispatched before pattern analysis completed");
        }
    }

    // Every registered unit was removed
    assert_eq!(job.inflight_count(), 0);

    // Pages persisted as fully labeled
    let pages = store.query("pages", &[Filter::eq("book_id", "s1")]).unwrap();
    assert_eq!(pages.len(), 2);
    for page in pages {
        assert_eq!(page.bool_field("label_done"), Some(true));
        assert!(page.str_field("blended_text").unwrap().contains("Body text"));
    }
}

// === Transient OCR failure on one page ===

#[tokio::test]
async fn transient_ocr_failure_retries() {
    let store = Arc::new(DocumentStore::open_in_memory().unwrap());
    let llm = FakeLlm::new(LlmScript {
        toc_range: None,
        body: Some((1, 10)),
        ..Default::default()
    });
    let ocr = FakeOcr::failing(5, 2);
    let harness = build_harness(llm.clone(), ocr.clone(), 10, test_engine_config(), store.clone());

    run_book(&harness, "s2", 10).await;

    let book = book_doc(&store, "s2");
    assert_eq!(book.str_field("status"), Some("complete"));

    // Page 5 took three attempts; every other page exactly one
    assert_eq!(ocr.attempts_for(5), 3);
    for page in (1..=10).filter(|p| *p != 5) {
        assert_eq!(ocr.attempts_for(page), 1, "page {page} should not retry");
    }

    // The blend still ran once per page
    assert_eq!(llm.count("blend"), 10);

    let page5 = store
        .query("pages", &[Filter::eq("book_id", "s2"), Filter::eq("page", 5)])
        .unwrap();
    assert_eq!(page5.len(), 1);
    assert_eq!(page5[0].bool_field("blend_done"), Some(true));
}

// === Retry budget exhaustion fails the book ===

#[tokio::test]
async fn ocr_retry_budget_exhaustion_fails_job() {
    let store = Arc::new(DocumentStore::open_in_memory().unwrap());
    let llm = FakeLlm::new(LlmScript::default());
    // Default budget is 3 retries; 10 failures can never succeed
    let ocr = FakeOcr::failing(1, 10);
    let harness = build_harness(llm, ocr.clone(), 2, test_engine_config(), store.clone());

    run_book(&harness, "s2b", 2).await;

    let book = book_doc(&store, "s2b");
    assert_eq!(book.str_field("status"), Some("failed"));
    // attempts = retries + 1
    assert_eq!(ocr.attempts_for(1), 4);
}

// === Finalize discovers a missing chapter ===

fn discovery_script() -> LlmScript {
    LlmScript {
        toc_range: Some((2, 2)),
        toc_entries: vec![
            json!({"title": "Chapter 1", "level": 0, "identifier": "1", "printed_page": "1"}),
            json!({"title": "Chapter 3", "level": 0, "identifier": "3", "printed_page": "41"}),
        ],
        entry_pages: HashMap::from([("Chapter 1".to_string(), 10), ("Chapter 3".to_string(), 50)]),
        chapter_pages: HashMap::from([("2".to_string(), 30)]),
        finalize_pattern: Some(json!({
            "patterns": [{"level_name": "chapter", "range_start": 1, "range_end": 3}],
            "excluded": [],
        })),
        body: Some((10, 60)),
    }
}

#[tokio::test]
async fn finalize_discovers_missing_chapter() {
    let store = Arc::new(DocumentStore::open_in_memory().unwrap());
    let llm = FakeLlm::new(discovery_script());
    let ocr = FakeOcr::new();
    let mut engine = test_engine_config();
    // Keep the validate phase quiet; discovery is the scenario
    engine.min_gap_size = 100;
    let harness = build_harness(llm.clone(), ocr, 60, engine, store.clone());

    run_book(&harness, "s3", 60).await;

    let book = book_doc(&store, "s3");
    assert_eq!(book.str_field("status"), Some("complete"));
    assert_eq!(book.str_field("finalize_phase"), Some("done"));
    assert_eq!(book.bool_field("toc_finalize_complete"), Some(true));
    assert_eq!(book.bool_field("structure_complete"), Some(true));

    // One chapter_finder ran, for identifier 2
    assert_eq!(llm.count("chapter_find"), 1);

    let toc = store.get_by_unique_key("tocs", "s3:toc").unwrap().unwrap();
    let toc_doc_id = toc.doc_id.clone();

    let entries = store
        .query("toc_entries", &[Filter::eq("toc_id", toc_doc_id.as_str())])
        .unwrap();
    assert_eq!(entries.len(), 3);

    let discovered = entries
        .iter()
        .find(|e| e.str_field("source") == Some("discovered"))
        .expect("discovered entry persisted");
    assert_eq!(
        discovered.unique_key.as_deref(),
        Some(format!("{toc_doc_id}:discovered:chapter_2").as_str())
    );
    assert_eq!(discovered.u64_field("actual_page"), Some(30));

    let page30 = store
        .query("pages", &[Filter::eq("book_id", "s3"), Filter::eq("page", 30)])
        .unwrap();
    assert_eq!(discovered.str_field("actual_page_id"), Some(page30[0].doc_id.as_str()));

    // After the re-sort the three entries sit at 100, 200, 300 in page
    // order
    let mut by_page: Vec<(u64, i64)> = entries
        .iter()
        .map(|e| {
            (
                e.u64_field("actual_page").unwrap(),
                e.body["sort_order"].as_i64().unwrap(),
            )
        })
        .collect();
    by_page.sort_unstable();
    assert_eq!(by_page, vec![(10, 100), (30, 200), (50, 300)]);

    // Structure built one chapter per entry with contiguous ranges
    let chapters = store.query("chapters", &[Filter::eq("book_id", "s3")]).unwrap();
    assert_eq!(chapters.len(), 3);
    let mut ranges: Vec<(u64, u64)> = chapters
        .iter()
        .map(|c| (c.u64_field("start_page").unwrap(), c.u64_field("end_page").unwrap()))
        .collect();
    ranges.sort_unstable();
    assert_eq!(ranges, vec![(10, 29), (30, 49), (50, 60)]);
    for chapter in &chapters {
        assert!(chapter.str_field("mechanical_text").is_some());
        assert!(chapter.str_field("polished_text").is_some());
        assert_eq!(chapter.bool_field("polish_failed"), Some(false));
    }
}

// === Repeat-run stability: unique keys survive a second pass ===

#[tokio::test]
async fn repeat_run_is_idempotent() {
    let store = Arc::new(DocumentStore::open_in_memory().unwrap());
    let llm = FakeLlm::new(discovery_script());
    let ocr = FakeOcr::new();
    let mut engine = test_engine_config();
    engine.min_gap_size = 100;
    let harness = build_harness(llm, ocr, 60, engine, store.clone());

    run_book(&harness, "rerun", 60).await;

    let keys_before: Vec<Option<String>> = {
        let mut entries = store.query("toc_entries", &[Filter::eq("book_id", "rerun")]).unwrap();
        entries.sort_by(|a, b| a.unique_key.cmp(&b.unique_key));
        entries.into_iter().map(|e| e.unique_key).collect()
    };

    // Resubmit the finished book; every op is terminal, so the job closes
    // out without creating anything new
    let state = load_book(&harness.store, &harness.services.engine, harness.prompts.clone(), "rerun")
        .await
        .unwrap();
    let job = Arc::new(BookJob::new(state, harness.services.clone()));
    harness.scheduler.submit(job).await.unwrap();
    wait_for_idle(&harness.scheduler).await;

    let keys_after: Vec<Option<String>> = {
        let mut entries = store.query("toc_entries", &[Filter::eq("book_id", "rerun")]).unwrap();
        entries.sort_by(|a, b| a.unique_key.cmp(&b.unique_key));
        entries.into_iter().map(|e| e.unique_key).collect()
    };
    assert_eq!(keys_before, keys_after);

    let chapters = store.query("chapters", &[Filter::eq("book_id", "rerun")]).unwrap();
    assert_eq!(chapters.len(), 3);

    let book = book_doc(&store, "rerun");
    assert_eq!(book.str_field("status"), Some("complete"));
}

// The failed-completion-persist rollback lives next to the
// implementation in src/job/book.rs, where the op completion path is
// directly reachable.

// === Crash after blend, before label ===

#[tokio::test]
async fn resume_after_blend_emits_only_labels() {
    let store = Arc::new(DocumentStore::open_in_memory().unwrap());
    let sink = WriteSink::spawn(store.clone());
    let total_pages = 4u32;

    // Persisted state: everything through blend committed, pattern
    // analysis complete, metadata and toc finder terminal, no labels
    let pattern = json!({
        "page_number_pattern": "arabic",
        "body_start": 1,
        "body_end": total_pages,
        "chapter_patterns": ["Chapter N"],
        "reasoning": "",
    });
    store
        .upsert(
            "books",
            "s5",
            json!({
                "book_id": "s5",
                "status": "processing",
                "pdf_path": "/fake/book.pdf",
                "total_pages": total_pages,
                "metadata_started": true, "metadata_complete": true,
                "toc_finder_started": true, "toc_finder_complete": true,
                "toc_found": false,
                "pattern_analysis_started": true, "pattern_analysis_complete": true,
                "pattern_analysis_json": pattern,
            }),
            json!({}),
        )
        .unwrap();
    store
        .upsert(
            "tocs",
            "s5:toc",
            json!({"book_id": "s5", "found": false}),
            json!({}),
        )
        .unwrap();

    for page in 1..=total_pages {
        store
            .upsert(
                "pages",
                &format!("s5:page:{page}"),
                json!({
                    "book_id": "s5",
                    "page": page,
                    "extract_done": true,
                    "image_path": format!("/fake/p{page}.png"),
                    "ocr_engA_text": page_text(page),
                    "blended_text": page_text(page),
                    "blend_done": true,
                }),
                json!({}),
            )
            .unwrap();
    }

    let engine = test_engine_config();
    let state = load_book(&store, &engine, PromptSet::embedded(), "s5").await.unwrap();
    let services = JobServices {
        store: store.clone(),
        sink,
        engine,
    };
    let job = BookJob::new(state, services);

    let units = job.start().await.unwrap();

    assert_eq!(units.len(), total_pages as usize);
    for unit in &units {
        assert_eq!(unit.metrics.stage, "label", "expected only label units");
        assert!(matches!(unit.payload, WorkPayload::Chat(_)));
    }
}

// === Link agent resumes mid-conversation ===

#[tokio::test]
async fn link_agent_resumes_from_checkpoint() {
    let store = Arc::new(DocumentStore::open_in_memory().unwrap());
    let sink = WriteSink::spawn(store.clone());
    let total_pages = 3u32;

    let pattern = json!({
        "page_number_pattern": "arabic",
        "body_start": 1,
        "body_end": total_pages,
        "chapter_patterns": ["Chapter N"],
        "reasoning": "",
    });
    store
        .upsert(
            "books",
            "s6",
            json!({
                "book_id": "s6",
                "status": "processing",
                "pdf_path": "/fake/book.pdf",
                "total_pages": total_pages,
                "metadata_started": true, "metadata_complete": true,
                "toc_finder_started": true, "toc_finder_complete": true,
                "toc_found": true,
                "toc_extract_started": true, "toc_extract_complete": true,
                "pattern_analysis_started": true, "pattern_analysis_complete": true,
                "pattern_analysis_json": pattern,
                "toc_link_started": true,
            }),
            json!({}),
        )
        .unwrap();

    let toc = store
        .upsert(
            "tocs",
            "s6:toc",
            json!({"book_id": "s6", "found": true, "start_page": 1, "end_page": 1}),
            json!({}),
        )
        .unwrap();

    let entry = store
        .upsert(
            "toc_entries",
            &format!("{}:toc:0", toc.doc_id),
            json!({
                "book_id": "s6",
                "toc_id": toc.doc_id,
                "unique_key": format!("{}:toc:0", toc.doc_id),
                "title": "Chapter 1",
                "level": 0,
                "sort_order": 100,
                "source": "toc",
            }),
            json!({}),
        )
        .unwrap();

    for page in 1..=total_pages {
        store
            .upsert(
                "pages",
                &format!("s6:page:{page}"),
                json!({
                    "book_id": "s6",
                    "page": page,
                    "extract_done": true,
                    "ocr_engA_text": page_text(page),
                    "blended_text": page_text(page),
                    "blend_done": true,
                    "label": {"page_label": null, "headings": [], "is_toc_page": false},
                    "label_done": true,
                }),
                json!({}),
            )
            .unwrap();
    }

    // Mid-loop checkpoint from the crashed run: iteration 3, a real
    // conversation in progress
    let saved = AgentState {
        agent_id: "agent-1".to_string(),
        agent_type: AgentType::TocEntryFinder,
        instance_key: entry.doc_id.clone(),
        iteration: 3,
        tool_calls_made: 4,
        complete: false,
        success: false,
        messages: vec![
            Message::user("Find the scan page where \"Chapter 1\" begins."),
            Message::assistant("searching for the heading"),
            Message::user("tool results: pages 1-2 (2 matches)"),
            Message::assistant("checking page 1 next"),
        ],
        pending_tool_calls: Vec::new(),
        tool_results: Vec::new(),
        result_json: None,
    };
    store
        .upsert(
            "agent_states",
            &saved.unique_key("s6"),
            json!({
                "book_id": "s6",
                "agent_type": "toc_entry_finder",
                "instance_key": entry.doc_id,
                "complete": false,
                "state": serde_json::to_value(&saved).unwrap(),
            }),
            json!({}),
        )
        .unwrap();

    let engine = test_engine_config();
    let state = load_book(&store, &engine, PromptSet::embedded(), "s6").await.unwrap();
    let services = JobServices {
        store: store.clone(),
        sink,
        engine,
    };
    let job = BookJob::new(state, services);

    let units = job.start().await.unwrap();

    let link_units: Vec<_> = units.iter().filter(|u| u.metrics.stage == "toc_link").collect();
    assert_eq!(link_units.len(), 1);

    // The resumed conversation, not a fresh system-prompt-only one
    let WorkPayload::Chat(request) = &link_units[0].payload else {
        panic!("link unit must be an LLM unit");
    };
    assert_eq!(request.messages.len(), 4);
    assert!(matches!(
        &request.messages[3].content,
        bindery::llm::MessageContent::Text(text) if text.contains("checking page 1")
    ));
}
