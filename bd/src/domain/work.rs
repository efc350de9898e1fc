//! Work unit and work result types
//!
//! The scheduler's dispatch atom. A unit names a provider pool and carries
//! a self-contained payload; the engine keeps a `WorkUnitInfo` per in-flight
//! id so completions can be routed without re-deriving context.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::llm::{ChatRequest, ChatResult, TokenUsage};
use crate::ocr::OcrOutput;

/// Pool class a unit dispatches to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitType {
    Llm,
    Ocr,
    Cpu,
}

impl std::fmt::Display for UnitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Llm => write!(f, "llm"),
            Self::Ocr => write!(f, "ocr"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

/// Metrics attribution carried by every unit
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricAttribution {
    /// Pipeline stage (`extract`, `ocr`, `blend`, `label`, `toc_find`, ...)
    pub stage: String,

    /// Item within the book (`page:5`, `entry:<doc_id>`, `gap:40-55`, ...)
    pub item_key: String,

    pub prompt_key: Option<String>,

    pub prompt_cid: Option<String>,

    pub book_id: String,
}

/// CPU task payloads executed on the CPU pool
#[derive(Debug, Clone)]
pub enum CpuTask {
    /// Rasterize one PDF page through the host's extractor
    ExtractPage { pdf_path: PathBuf, page: u32 },

    /// Merge page texts into a chapter body, stripping per-page furniture
    MergeChapterText {
        chapter_key: String,
        pages: Vec<PageTextInput>,
    },
}

/// One page's contribution to a chapter merge
#[derive(Debug, Clone)]
pub struct PageTextInput {
    pub page: u32,
    pub text: String,
    pub header: Option<String>,
    pub footer: Option<String>,
}

/// Unit payload
#[derive(Debug, Clone)]
pub enum WorkPayload {
    Chat(Box<ChatRequest>),
    Ocr { image_path: PathBuf },
    Cpu(CpuTask),
}

/// The scheduler's unit of dispatch
#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub id: Uuid,

    pub job_id: String,

    pub unit_type: UnitType,

    /// Provider name; empty for CPU units
    pub provider: String,

    pub payload: WorkPayload,

    pub metrics: MetricAttribution,
}

impl WorkUnit {
    /// LLM unit against a named provider
    pub fn llm(job_id: impl Into<String>, provider: impl Into<String>, request: ChatRequest, metrics: MetricAttribution) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id: job_id.into(),
            unit_type: UnitType::Llm,
            provider: provider.into(),
            payload: WorkPayload::Chat(Box::new(request)),
            metrics,
        }
    }

    /// OCR unit against a named engine
    pub fn ocr(
        job_id: impl Into<String>,
        provider: impl Into<String>,
        image_path: PathBuf,
        metrics: MetricAttribution,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id: job_id.into(),
            unit_type: UnitType::Ocr,
            provider: provider.into(),
            payload: WorkPayload::Ocr { image_path },
            metrics,
        }
    }

    /// CPU unit
    pub fn cpu(job_id: impl Into<String>, task: CpuTask, metrics: MetricAttribution) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id: job_id.into(),
            unit_type: UnitType::Cpu,
            provider: String::new(),
            payload: WorkPayload::Cpu(task),
            metrics,
        }
    }
}

/// CPU task outcomes
#[derive(Debug, Clone)]
pub enum CpuOutcome {
    PageExtracted {
        image_path: PathBuf,
        embedded_text: Option<String>,
    },
    ChapterMerged {
        chapter_key: String,
        text: String,
        word_count: u32,
    },
}

/// Successful payload of a work result
#[derive(Debug, Clone)]
pub enum WorkOutcome {
    Chat(ChatResult),
    Ocr(OcrOutput),
    Cpu(CpuOutcome),
}

/// Completion of one work unit
#[derive(Debug, Clone)]
pub struct WorkResult {
    pub unit_id: Uuid,

    pub success: bool,

    /// True when the unit's job was cancelled mid-flight; never retried
    pub cancelled: bool,

    pub error: Option<String>,

    pub outcome: Option<WorkOutcome>,

    pub usage: TokenUsage,

    /// Cost attributed by the scheduler (model pricing or OCR-reported)
    pub cost_usd: f64,

    pub latency_ms: u64,
}

impl WorkResult {
    /// Successful completion
    pub fn ok(unit_id: Uuid, outcome: WorkOutcome) -> Self {
        Self {
            unit_id,
            success: true,
            cancelled: false,
            error: None,
            outcome: Some(outcome),
            usage: TokenUsage::default(),
            cost_usd: 0.0,
            latency_ms: 0,
        }
    }

    /// Failed completion
    pub fn failed(unit_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            unit_id,
            success: false,
            cancelled: false,
            error: Some(error.into()),
            outcome: None,
            usage: TokenUsage::default(),
            cost_usd: 0.0,
            latency_ms: 0,
        }
    }

    /// Cancelled completion
    pub fn cancelled(unit_id: Uuid) -> Self {
        Self {
            unit_id,
            success: false,
            cancelled: true,
            error: Some("cancelled".to_string()),
            outcome: None,
            usage: TokenUsage::default(),
            cost_usd: 0.0,
            latency_ms: 0,
        }
    }

    /// The chat result, if this was a successful LLM unit
    pub fn chat(&self) -> Option<&ChatResult> {
        match &self.outcome {
            Some(WorkOutcome::Chat(result)) => Some(result),
            _ => None,
        }
    }

    /// The OCR output, if this was a successful OCR unit
    pub fn ocr(&self) -> Option<&OcrOutput> {
        match &self.outcome {
            Some(WorkOutcome::Ocr(output)) => Some(output),
            _ => None,
        }
    }

    /// The CPU outcome, if this was a successful CPU unit
    pub fn cpu(&self) -> Option<&CpuOutcome> {
        match &self.outcome {
            Some(WorkOutcome::Cpu(outcome)) => Some(outcome),
            _ => None,
        }
    }
}

/// Symbolic kind of an in-flight unit, used to route completions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    Extract,
    Ocr,
    Blend,
    Label,
    Metadata,
    TocFinder,
    TocExtract,
    PatternAnalysis,
    TocLink,
    FinalizePattern,
    FinalizeDiscover,
    FinalizeValidate,
    StructureMerge,
    StructureClassify,
    StructurePolish,
}

impl UnitKind {
    /// Page-level kinds retry per unit; book-level kinds fail their op
    pub fn is_page_level(&self) -> bool {
        matches!(self, UnitKind::Extract | UnitKind::Ocr | UnitKind::Blend | UnitKind::Label)
    }

    /// Metrics stage name
    pub fn stage(&self) -> &'static str {
        match self {
            UnitKind::Extract => "extract",
            UnitKind::Ocr => "ocr",
            UnitKind::Blend => "blend",
            UnitKind::Label => "label",
            UnitKind::Metadata => "metadata",
            UnitKind::TocFinder => "toc_find",
            UnitKind::TocExtract => "toc_extract",
            UnitKind::PatternAnalysis => "pattern_analysis",
            UnitKind::TocLink => "toc_link",
            UnitKind::FinalizePattern => "finalize_pattern",
            UnitKind::FinalizeDiscover => "finalize_discover",
            UnitKind::FinalizeValidate => "finalize_validate",
            UnitKind::StructureMerge => "structure_merge",
            UnitKind::StructureClassify => "structure_classify",
            UnitKind::StructurePolish => "structure_polish",
        }
    }
}

/// Pattern analysis sub-unit tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternSubtype {
    PageNumbers,
    ChapterPatterns,
    BodyBoundaries,
}

/// Engine-side registration for an in-flight unit
#[derive(Debug, Clone)]
pub struct WorkUnitInfo {
    pub kind: UnitKind,

    pub page: Option<u32>,

    pub provider: Option<String>,

    pub retry_count: u32,

    /// ToC entry doc id (link units)
    pub entry_doc_id: Option<String>,

    /// Entry-to-find or gap key (finalize units)
    pub finalize_key: Option<String>,

    pub chapter_key: Option<String>,

    pub pattern_subtype: Option<PatternSubtype>,
}

impl WorkUnitInfo {
    /// Info for a page-level unit
    pub fn page(kind: UnitKind, page: u32) -> Self {
        Self {
            kind,
            page: Some(page),
            provider: None,
            retry_count: 0,
            entry_doc_id: None,
            finalize_key: None,
            chapter_key: None,
            pattern_subtype: None,
        }
    }

    /// Info for a book-level unit
    pub fn book(kind: UnitKind) -> Self {
        Self {
            kind,
            page: None,
            provider: None,
            retry_count: 0,
            entry_doc_id: None,
            finalize_key: None,
            chapter_key: None,
            pattern_subtype: None,
        }
    }

    /// Builder: set the provider
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    /// Builder: set the entry doc id
    pub fn with_entry(mut self, entry_doc_id: impl Into<String>) -> Self {
        self.entry_doc_id = Some(entry_doc_id.into());
        self
    }

    /// Builder: set the finalize key
    pub fn with_finalize_key(mut self, key: impl Into<String>) -> Self {
        self.finalize_key = Some(key.into());
        self
    }

    /// Builder: set the chapter key
    pub fn with_chapter(mut self, chapter_key: impl Into<String>) -> Self {
        self.chapter_key = Some(chapter_key.into());
        self
    }

    /// Builder: set the pattern subtype
    pub fn with_subtype(mut self, subtype: PatternSubtype) -> Self {
        self.pattern_subtype = Some(subtype);
        self
    }

    /// Copy for a retry attempt
    pub fn retry(&self) -> Self {
        let mut info = self.clone();
        info.retry_count += 1;
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_constructors_set_type() {
        let metrics = MetricAttribution::default();
        let unit = WorkUnit::ocr("job-1", "engA", PathBuf::from("/tmp/p1.png"), metrics.clone());
        assert_eq!(unit.unit_type, UnitType::Ocr);
        assert_eq!(unit.provider, "engA");

        let unit = WorkUnit::cpu(
            "job-1",
            CpuTask::ExtractPage {
                pdf_path: PathBuf::from("/tmp/book.pdf"),
                page: 3,
            },
            metrics,
        );
        assert_eq!(unit.unit_type, UnitType::Cpu);
        assert!(unit.provider.is_empty());
    }

    #[test]
    fn test_retry_increments_count() {
        let info = WorkUnitInfo::page(UnitKind::Ocr, 5).with_provider("engA");
        let retried = info.retry();
        assert_eq!(retried.retry_count, 1);
        assert_eq!(retried.retry().retry_count, 2);
        assert_eq!(retried.page, Some(5));
    }

    #[test]
    fn test_page_level_classification() {
        assert!(UnitKind::Blend.is_page_level());
        assert!(UnitKind::Extract.is_page_level());
        assert!(!UnitKind::Metadata.is_page_level());
        assert!(!UnitKind::FinalizeDiscover.is_page_level());
    }

    #[test]
    fn test_result_accessors() {
        let id = Uuid::new_v4();
        let result = WorkResult::ok(
            id,
            WorkOutcome::Cpu(CpuOutcome::ChapterMerged {
                chapter_key: "b1:ch1".to_string(),
                text: "text".to_string(),
                word_count: 1,
            }),
        );
        assert!(result.cpu().is_some());
        assert!(result.chat().is_none());

        let result = WorkResult::cancelled(id);
        assert!(!result.success);
        assert!(result.cancelled);
    }
}
