//! ToC finder agent
//!
//! One per book. Greps and reads front-matter pages until it can say
//! whether a table of contents exists and which scan pages hold it.

use eyre::Result;
use serde_json::{Value, json};

use crate::domain::BookState;

use super::runtime::{AgentBudgets, ToolLoopAgent};
use super::state::AgentType;
use super::tools::ToolExecutor;

/// Instance key: one finder per book
pub const INSTANCE_KEY: &str = "toc";

/// Build a fresh ToC finder for the book
pub fn new_agent(state: &BookState, budgets: AgentBudgets) -> Result<ToolLoopAgent> {
    let system_prompt = state
        .prompts()
        .render("toc_find_system", &json!({"total_pages": state.total_pages()}))?;

    Ok(ToolLoopAgent::new(
        AgentType::TocFinder,
        INSTANCE_KEY,
        system_prompt,
        "Locate the table of contents. Start by searching the front matter.",
        result_schema(),
        ToolExecutor::page_tools(),
        budgets,
    ))
}

fn result_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "found": { "type": "boolean" },
            "start_page": { "type": "integer", "description": "First scan page of the ToC" },
            "end_page": { "type": "integer", "description": "Last scan page of the ToC" },
            "reasoning": { "type": "string" }
        },
        "required": ["found"]
    })
}

/// The finder's structured answer
#[derive(Debug, Clone, Default)]
pub struct TocFinderResult {
    pub found: bool,
    pub start_page: Option<u32>,
    pub end_page: Option<u32>,
}

impl TocFinderResult {
    pub fn from_json(value: &Value) -> Self {
        let found = value["found"].as_bool().unwrap_or(false);
        let start_page = value["start_page"].as_u64().map(|p| p as u32);
        let end_page = value["end_page"].as_u64().map(|p| p as u32);

        Self {
            found: found && start_page.is_some(),
            start_page,
            // A single-page ToC may omit end_page
            end_page: end_page.or(start_page),
        }
    }
}
