//! Persisted agent checkpoints

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::{Message, ToolCall};

/// The four tool-using agent kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    TocFinder,
    TocEntryFinder,
    ChapterFinder,
    GapInvestigator,
}

impl AgentType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TocFinder => "toc_finder",
            Self::TocEntryFinder => "toc_entry_finder",
            Self::ChapterFinder => "chapter_finder",
            Self::GapInvestigator => "gap_investigator",
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A tool result captured in a checkpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedToolResult {
    pub tool_use_id: String,
    pub content: String,
    pub is_error: bool,
}

/// Serializable snapshot of a tool-loop agent
///
/// Authoritative for resumption: a non-complete saved state rehydrates the
/// fresh agent object before it executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub agent_id: String,

    pub agent_type: AgentType,

    /// Entry doc id, entry-to-find key, gap key, or "toc"
    pub instance_key: String,

    pub iteration: u32,

    pub tool_calls_made: u32,

    pub complete: bool,

    pub success: bool,

    #[serde(default)]
    pub messages: Vec<Message>,

    #[serde(default)]
    pub pending_tool_calls: Vec<ToolCall>,

    #[serde(default)]
    pub tool_results: Vec<SavedToolResult>,

    pub result_json: Option<Value>,
}

impl AgentState {
    /// Stable store key for this checkpoint
    pub fn unique_key(&self, book_id: &str) -> String {
        format!("{book_id}:agent:{}:{}", self.agent_type.name(), self.instance_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_key() {
        let state = AgentState {
            agent_id: "a1".to_string(),
            agent_type: AgentType::TocEntryFinder,
            instance_key: "entry-9".to_string(),
            iteration: 3,
            tool_calls_made: 5,
            complete: false,
            success: false,
            messages: Vec::new(),
            pending_tool_calls: Vec::new(),
            tool_results: Vec::new(),
            result_json: None,
        };
        assert_eq!(state.unique_key("b1"), "b1:agent:toc_entry_finder:entry-9");
    }

    #[test]
    fn test_serde_round_trip() {
        let state = AgentState {
            agent_id: "a1".to_string(),
            agent_type: AgentType::ChapterFinder,
            instance_key: "chapter_2".to_string(),
            iteration: 2,
            tool_calls_made: 4,
            complete: false,
            success: false,
            messages: vec![Message::user("find chapter 2")],
            pending_tool_calls: Vec::new(),
            tool_results: Vec::new(),
            result_json: None,
        };

        let text = serde_json::to_string(&state).unwrap();
        let back: AgentState = serde_json::from_str(&text).unwrap();
        assert_eq!(back.agent_type, AgentType::ChapterFinder);
        assert_eq!(back.iteration, 2);
        assert_eq!(back.messages.len(), 1);
    }
}
