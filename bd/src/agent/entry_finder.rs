//! ToC entry finder agent
//!
//! One per unlinked ToC entry during link_toc. Finds the scan page where
//! the entry's chapter actually begins; the printed page number is only a
//! hint because of the front-matter offset.

use eyre::Result;
use serde_json::{Value, json};

use crate::domain::{BookState, TocEntry};

use super::runtime::{AgentBudgets, ToolLoopAgent};
use super::state::AgentType;
use super::tools::ToolExecutor;

/// Build a finder for one entry; the instance key is the entry's doc id
pub fn new_agent(state: &BookState, entry: &TocEntry, budgets: AgentBudgets) -> Result<ToolLoopAgent> {
    let system_prompt = state.prompts().render(
        "entry_find_system",
        &json!({
            "total_pages": state.total_pages(),
            "title": entry.title,
            "printed_page": entry.printed_page.as_deref().unwrap_or("unknown"),
        }),
    )?;

    Ok(ToolLoopAgent::new(
        AgentType::TocEntryFinder,
        entry.doc_id.clone(),
        system_prompt,
        format!("Find the scan page where \"{}\" begins.", entry.title),
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
            "scan_page": { "type": "integer", "description": "Scan page where the entry begins" },
            "reasoning": { "type": "string" }
        },
        "required": ["found"]
    })
}

/// The finder's structured answer
#[derive(Debug, Clone, Default)]
pub struct EntryFindResult {
    pub found: bool,
    pub scan_page: Option<u32>,
}

impl EntryFindResult {
    pub fn from_json(value: &Value) -> Self {
        let scan_page = value["scan_page"].as_u64().map(|p| p as u32);
        Self {
            found: value["found"].as_bool().unwrap_or(false) && scan_page.is_some(),
            scan_page,
        }
    }
}
