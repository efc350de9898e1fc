//! Domain types for the per-book engine
//!
//! `BookState` is the root aggregate; everything else is the vocabulary it
//! is built from: page records, the book-operation state machine, ToC and
//! chapter records, and the scheduler's work-unit types.

pub mod book;
pub mod chapter;
pub mod operation;
pub mod page;
pub mod toc;
pub mod work;

pub use book::{BookMetadata, BookProviders, BookState, CostTotals};
pub use chapter::{ChapterState, MatterType};
pub use operation::{BookOp, OpStatus, OperationState};
pub use page::{PageLabel, PageState};
pub use toc::{
    DiscoveredPattern, EntrySource, EntryToFind, ExcludedRange, FinalizeGap, FinalizePatternResult, FinalizePhase,
    FixType, PatternAnalysisResult, TocEntry, TocInfo,
};
pub use work::{
    CpuOutcome, CpuTask, MetricAttribution, PageTextInput, PatternSubtype, UnitKind, UnitType, WorkOutcome,
    WorkPayload, WorkResult, WorkUnit, WorkUnitInfo,
};
