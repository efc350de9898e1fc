//! Agent runtime and the book's tool-using agents
//!
//! An agent is a multi-turn, tool-using LLM conversation driven toward a
//! structured result. Every LLM turn is a scheduler work unit; tool calls
//! execute locally between turns; the conversation checkpoints so a crash
//! resumes mid-loop instead of restarting.

pub mod chapter_finder;
pub mod entry_finder;
pub mod gap_investigator;
mod runtime;
mod state;
pub mod toc_finder;
mod tools;

pub use runtime::{AgentBudgets, AgentPhase, AgentStep, ToolLoopAgent};
pub use state::{AgentState, AgentType, SavedToolResult};
pub use tools::{GetPageOcrTool, GrepTextTool, Tool, ToolContext, ToolExecutor, ToolResult};
