//! Chapter finder agent
//!
//! One per entry-to-find during finalize discovery. The pattern phase has
//! concluded that a chapter with this identifier should exist; this agent
//! hunts for where it begins.

use eyre::Result;
use serde_json::{Value, json};

use crate::domain::{BookState, EntryToFind};

use super::runtime::{AgentBudgets, ToolLoopAgent};
use super::state::AgentType;
use super::tools::ToolExecutor;

/// Build a finder for one missing entry; the instance key is the
/// entry-to-find key ("chapter_2")
pub fn new_agent(state: &BookState, entry: &EntryToFind, budgets: AgentBudgets) -> Result<ToolLoopAgent> {
    let system_prompt = state.prompts().render(
        "chapter_find_system",
        &json!({
            "total_pages": state.total_pages(),
            "level_name": entry.level_name,
            "identifier": entry.identifier,
        }),
    )?;

    Ok(ToolLoopAgent::new(
        AgentType::ChapterFinder,
        entry.key.clone(),
        system_prompt,
        format!(
            "Find where {} {} begins in the scan.",
            entry.level_name, entry.identifier
        ),
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
            "scan_page": { "type": "integer", "description": "Scan page where the chapter begins" },
            "title": { "type": "string", "description": "Chapter title as printed" },
            "reasoning": { "type": "string" }
        },
        "required": ["found"]
    })
}

/// The finder's structured answer
#[derive(Debug, Clone, Default)]
pub struct ChapterFindResult {
    pub found: bool,
    pub scan_page: Option<u32>,
    pub title: Option<String>,
}

impl ChapterFindResult {
    pub fn from_json(value: &Value) -> Self {
        let scan_page = value["scan_page"].as_u64().map(|p| p as u32);
        Self {
            found: value["found"].as_bool().unwrap_or(false) && scan_page.is_some(),
            scan_page,
            title: value["title"].as_str().map(String::from),
        }
    }
}
