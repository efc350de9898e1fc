//! Book-operation state machine
//!
//! Every coarse-grained book operation (metadata, toc_finder, ...) is one
//! of these. The legal transitions:
//!
//! ```text
//! NotStarted --start--> InProgress --complete--> Complete
//!                            |
//!                          fail(max): retries+1; >= max -> Failed
//!                                               else     -> NotStarted
//! ```
//!
//! `Complete` and `Failed` are terminal; only terminal ops let the job
//! finish.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Status of a book operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpStatus {
    #[default]
    NotStarted,
    InProgress,
    Complete,
    Failed,
}

impl std::fmt::Display for OpStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// State of one book operation
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct OperationState {
    status: OpStatus,
    retries: u32,
}

impl OperationState {
    /// Fresh, not-started operation
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted book fields
    pub fn from_fields(started: bool, complete: bool, failed: bool, retries: u32) -> Self {
        let status = if complete {
            OpStatus::Complete
        } else if failed {
            OpStatus::Failed
        } else if started {
            OpStatus::InProgress
        } else {
            OpStatus::NotStarted
        };
        Self { status, retries }
    }

    pub fn status(&self) -> OpStatus {
        self.status
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Only a not-started op may start
    pub fn can_start(&self) -> bool {
        self.status == OpStatus::NotStarted
    }

    /// Begin the operation; true if the transition happened
    pub fn start(&mut self) -> bool {
        if self.can_start() {
            self.status = OpStatus::InProgress;
            true
        } else {
            false
        }
    }

    /// Terminal success
    pub fn complete(&mut self) {
        self.status = OpStatus::Complete;
    }

    /// Record a failure; exhausting the budget is terminal, otherwise the
    /// op returns to `NotStarted` for another attempt
    pub fn fail(&mut self, max_retries: u32) -> OpStatus {
        self.retries += 1;
        self.status = if self.retries >= max_retries {
            OpStatus::Failed
        } else {
            OpStatus::NotStarted
        };
        self.status
    }

    /// Undo a `start` whose unit could not be created; no retry consumed
    pub fn reset(&mut self) {
        if self.status == OpStatus::InProgress {
            self.status = OpStatus::NotStarted;
        }
    }

    pub fn is_started(&self) -> bool {
        self.status == OpStatus::InProgress
    }

    pub fn is_complete(&self) -> bool {
        self.status == OpStatus::Complete
    }

    pub fn is_failed(&self) -> bool {
        self.status == OpStatus::Failed
    }

    /// Terminal either way
    pub fn is_done(&self) -> bool {
        self.is_complete() || self.is_failed()
    }

    /// Persisted field patch for the book document
    pub fn to_fields(&self, op_name: &str) -> Value {
        json!({
            format!("{op_name}_started"): self.status != OpStatus::NotStarted,
            format!("{op_name}_complete"): self.is_complete(),
            format!("{op_name}_failed"): self.is_failed(),
            format!("{op_name}_retries"): self.retries,
        })
    }
}

/// The seven book operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BookOp {
    Metadata,
    TocFinder,
    TocExtract,
    TocLink,
    TocFinalize,
    PatternAnalysis,
    Structure,
}

impl BookOp {
    /// Persisted field prefix
    pub fn name(&self) -> &'static str {
        match self {
            Self::Metadata => "metadata",
            Self::TocFinder => "toc_finder",
            Self::TocExtract => "toc_extract",
            Self::TocLink => "toc_link",
            Self::TocFinalize => "toc_finalize",
            Self::PatternAnalysis => "pattern_analysis",
            Self::Structure => "structure",
        }
    }

    /// All operations, in pipeline order
    pub fn all() -> [BookOp; 7] {
        [
            Self::Metadata,
            Self::TocFinder,
            Self::TocExtract,
            Self::PatternAnalysis,
            Self::TocLink,
            Self::TocFinalize,
            Self::Structure,
        ]
    }
}

impl std::fmt::Display for BookOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_start_only_from_not_started() {
        let mut op = OperationState::new();
        assert!(op.can_start());
        assert!(op.start());
        assert!(!op.can_start());
        assert!(!op.start());

        op.complete();
        assert!(!op.start());
    }

    #[test]
    fn test_fail_demotes_until_budget_exhausted() {
        let mut op = OperationState::new();
        op.start();
        assert_eq!(op.fail(2), OpStatus::NotStarted);
        assert_eq!(op.retries(), 1);

        op.start();
        assert_eq!(op.fail(2), OpStatus::Failed);
        assert!(op.is_failed());
        assert!(op.is_done());
    }

    #[test]
    fn test_reset_consumes_no_retry() {
        let mut op = OperationState::new();
        op.start();
        op.reset();
        assert!(op.can_start());
        assert_eq!(op.retries(), 0);

        // Reset outside InProgress is a no-op
        op.start();
        op.complete();
        op.reset();
        assert!(op.is_complete());
    }

    #[test]
    fn test_field_round_trip() {
        let mut op = OperationState::new();
        op.start();
        op.fail(5);
        op.start();

        let fields = op.to_fields("toc_finder");
        assert_eq!(fields["toc_finder_started"], true);
        assert_eq!(fields["toc_finder_complete"], false);
        assert_eq!(fields["toc_finder_retries"], 1);

        let restored = OperationState::from_fields(true, false, false, 1);
        assert!(restored.is_started());
        assert_eq!(restored.retries(), 1);
    }

    proptest! {
        // Whatever sequence of events is applied, the state stays legal:
        // terminal states are sticky except through explicit fail budgets,
        // and retries never exceed attempts.
        #[test]
        fn prop_fsm_legality(events in proptest::collection::vec(0u8..4, 0..64)) {
            let mut op = OperationState::new();
            let max_retries = 3;
            let mut completed = false;

            for event in events {
                let before = op.status();
                match event {
                    0 => {
                        let started = op.start();
                        prop_assert_eq!(started, before == OpStatus::NotStarted);
                    }
                    1 => {
                        if op.is_started() {
                            op.complete();
                            completed = true;
                        }
                    }
                    2 => {
                        if op.is_started() {
                            op.fail(max_retries);
                        }
                    }
                    _ => op.reset(),
                }

                if completed {
                    prop_assert!(op.is_complete());
                }
                prop_assert!(op.retries() <= max_retries);
                if op.is_failed() {
                    prop_assert_eq!(op.retries(), max_retries);
                }
            }
        }
    }
}
