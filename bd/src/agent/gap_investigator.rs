//! Gap investigator agent
//!
//! One per unexplained page span during finalize validation. Decides
//! whether the span hides a missing chapter, a mislinked entry, or
//! nothing at all.

use eyre::Result;
use serde_json::{Value, json};

use crate::domain::{BookState, FinalizeGap, FixType};

use super::runtime::{AgentBudgets, ToolLoopAgent};
use super::state::AgentType;
use super::tools::ToolExecutor;

/// Build an investigator for one gap; the instance key is the gap key
pub fn new_agent(state: &BookState, gap: &FinalizeGap, budgets: AgentBudgets) -> Result<ToolLoopAgent> {
    let system_prompt = state.prompts().render(
        "gap_investigate_system",
        &json!({
            "total_pages": state.total_pages(),
            "start_page": gap.start_page,
            "end_page": gap.end_page,
        }),
    )?;

    Ok(ToolLoopAgent::new(
        AgentType::GapInvestigator,
        gap.key.clone(),
        system_prompt,
        format!("Investigate pages {}-{}.", gap.start_page, gap.end_page),
        result_schema(),
        ToolExecutor::page_tools(),
        budgets,
    ))
}

fn result_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "fix_type": {
                "type": "string",
                "enum": ["add_entry", "correct_entry", "flag_for_review", "no_fix_needed"]
            },
            "title": { "type": "string", "description": "Title of the missing chapter (add_entry)" },
            "scan_page": { "type": "integer", "description": "Scan page for the fix" },
            "entry_title": { "type": "string", "description": "Title of the mislinked entry (correct_entry)" },
            "reasoning": { "type": "string" }
        },
        "required": ["fix_type"]
    })
}

/// The investigator's structured answer
#[derive(Debug, Clone)]
pub struct GapFixResult {
    pub fix_type: FixType,
    pub title: Option<String>,
    pub scan_page: Option<u32>,
    pub entry_title: Option<String>,
    pub reasoning: Option<String>,
}

impl GapFixResult {
    pub fn from_json(value: &Value) -> Self {
        let fix_type = serde_json::from_value(value["fix_type"].clone()).unwrap_or(FixType::NoFixNeeded);
        let scan_page = value["scan_page"].as_u64().map(|p| p as u32);

        // A fix without its page cannot be applied
        let fix_type = match fix_type {
            FixType::AddEntry | FixType::CorrectEntry if scan_page.is_none() => FixType::FlagForReview,
            other => other,
        };

        Self {
            fix_type,
            title: value["title"].as_str().map(String::from),
            scan_page,
            entry_title: value["entry_title"].as_str().map(String::from),
            reasoning: value["reasoning"].as_str().map(String::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_entry_fix() {
        let result = GapFixResult::from_json(&json!({
            "fix_type": "add_entry",
            "title": "Interlude",
            "scan_page": 44,
        }));
        assert_eq!(result.fix_type, FixType::AddEntry);
        assert_eq!(result.scan_page, Some(44));
    }

    #[test]
    fn test_fix_without_page_degrades_to_review() {
        let result = GapFixResult::from_json(&json!({"fix_type": "correct_entry"}));
        assert_eq!(result.fix_type, FixType::FlagForReview);
    }

    #[test]
    fn test_unknown_fix_type_is_no_fix() {
        let result = GapFixResult::from_json(&json!({"fix_type": "demolish"}));
        assert_eq!(result.fix_type, FixType::NoFixNeeded);
    }
}
