//! Agent tools - read-only access to the book's page text
//!
//! Agents hold the book state only to read, never to mutate. Output is
//! clamped so a greedy query cannot blow out the conversation.

use std::sync::Arc;

use async_trait::async_trait;
use regex::RegexBuilder;
use serde_json::{Value, json};

use crate::domain::BookState;
use crate::llm::{ToolCall, ToolDefinition};

/// Fraction of the book past which pages are flagged as back matter
const BACK_MATTER_FRACTION: f64 = 0.8;

const MAX_MATCHES_PER_CLUSTER: usize = 5;
const MAX_CLUSTERS: usize = 10;
const MAX_LINE_CHARS: usize = 200;
const MAX_PAGE_CHARS: usize = 8000;

/// Context handed to tool executions
#[derive(Clone)]
pub struct ToolContext {
    pub state: Arc<BookState>,
}

impl ToolContext {
    pub fn new(state: Arc<BookState>) -> Self {
        Self { state }
    }
}

/// Result of a tool execution
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    /// Successful result
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    /// Error result
    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// A tool callable by an agent's LLM
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn input_schema(&self) -> Value;

    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolResult;
}

/// Tool registry for one agent
pub struct ToolExecutor {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolExecutor {
    /// The page-access toolset every book agent uses
    pub fn page_tools() -> Self {
        Self {
            tools: vec![Arc::new(GrepTextTool), Arc::new(GetPageOcrTool)],
        }
    }

    /// Tool definitions for the LLM
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition::new(t.name(), t.description(), t.input_schema()))
            .collect()
    }

    /// Execute one tool call
    pub async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResult {
        match self.tools.iter().find(|t| t.name() == call.name) {
            Some(tool) => tool.execute(call.input.clone(), ctx).await,
            None => ToolResult::error(format!("Unknown tool: {}", call.name)),
        }
    }
}

/// Case-insensitive regex search over all pages
///
/// Matches are grouped into clusters of nearby pages (gap of three or
/// fewer), and clusters past 80% of the book carry a back-matter flag so
/// agents do not mistake an index hit for a chapter start.
pub struct GrepTextTool;

#[async_trait]
impl Tool for GrepTextTool {
    fn name(&self) -> &'static str {
        "grep_text"
    }

    fn description(&self) -> &'static str {
        "Case-insensitive regex search across all page texts. Returns matching lines grouped by page cluster."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Regex pattern to search for"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolResult {
        let Some(query) = input.get("query").and_then(|v| v.as_str()) else {
            return ToolResult::error("Missing required parameter: query");
        };

        let regex = match RegexBuilder::new(query).case_insensitive(true).build() {
            Ok(r) => r,
            Err(e) => return ToolResult::error(format!("Invalid regex: {e}")),
        };

        let total_pages = ctx.state.total_pages();
        let mut matches: Vec<(u32, String)> = Vec::new();

        for page in ctx.state.pages_snapshot() {
            let Some(text) = page.best_text() else { continue };
            for line in text.lines() {
                if regex.is_match(line) {
                    let mut line = line.trim().to_string();
                    if line.len() > MAX_LINE_CHARS {
                        line.truncate(MAX_LINE_CHARS);
                        line.push('…');
                    }
                    matches.push((page.page, line));
                }
            }
        }

        if matches.is_empty() {
            return ToolResult::success("No matches found.");
        }

        let clusters = cluster_matches(&matches);
        let mut out = String::new();

        for cluster in clusters.iter().take(MAX_CLUSTERS) {
            let first = cluster.first().expect("cluster non-empty").0;
            let last = cluster.last().expect("cluster non-empty").0;
            let back_matter = first as f64 > total_pages as f64 * BACK_MATTER_FRACTION;

            if first == last {
                out.push_str(&format!("page {first} ({} matches)", cluster.len()));
            } else {
                out.push_str(&format!("pages {first}-{last} ({} matches)", cluster.len()));
            }
            if back_matter {
                out.push_str(" — in back matter");
            }
            out.push_str(":\n");

            for (page, line) in cluster.iter().take(MAX_MATCHES_PER_CLUSTER) {
                out.push_str(&format!("  p{page}: {line}\n"));
            }
            if cluster.len() > MAX_MATCHES_PER_CLUSTER {
                out.push_str(&format!("  … {} more\n", cluster.len() - MAX_MATCHES_PER_CLUSTER));
            }
        }

        if clusters.len() > MAX_CLUSTERS {
            out.push_str(&format!("… {} more clusters\n", clusters.len() - MAX_CLUSTERS));
        }

        ToolResult::success(out)
    }
}

/// Group page matches into clusters with gaps of at most three pages
fn cluster_matches(matches: &[(u32, String)]) -> Vec<Vec<(u32, String)>> {
    let mut clusters: Vec<Vec<(u32, String)>> = Vec::new();

    for (page, line) in matches {
        match clusters.last_mut() {
            Some(cluster) if page - cluster.last().expect("cluster non-empty").0 <= 3 => {
                cluster.push((*page, line.clone()));
            }
            _ => clusters.push(vec![(*page, line.clone())]),
        }
    }

    clusters
}

/// Read one page's text
pub struct GetPageOcrTool;

#[async_trait]
impl Tool for GetPageOcrTool {
    fn name(&self) -> &'static str {
        "get_page_ocr"
    }

    fn description(&self) -> &'static str {
        "Return the recognized text of one page (blended when available)."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "page_num": {
                    "type": "integer",
                    "description": "Page number, 1-indexed"
                }
            },
            "required": ["page_num"]
        })
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolResult {
        let Some(page_num) = input.get("page_num").and_then(|v| v.as_u64()) else {
            return ToolResult::error("Missing required parameter: page_num");
        };
        let page_num = page_num as u32;

        let total_pages = ctx.state.total_pages();
        if page_num == 0 || page_num > total_pages {
            return ToolResult::error(format!("Page {page_num} out of range (book has {total_pages} pages)"));
        }

        let Some(page) = ctx.state.page(page_num) else {
            return ToolResult::error(format!("Page {page_num} has no text yet"));
        };
        let Some(text) = page.best_text() else {
            return ToolResult::error(format!("Page {page_num} has no text yet"));
        };

        let mut out = String::new();
        if page_num as f64 > total_pages as f64 * BACK_MATTER_FRACTION {
            out.push_str("note: this page is in the last 20% of the book (likely back matter)\n\n");
        }

        if text.len() > MAX_PAGE_CHARS {
            out.push_str(&text[..MAX_PAGE_CHARS]);
            out.push_str("\n[truncated]");
        } else {
            out.push_str(text);
        }

        ToolResult::success(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BookProviders, BookState};
    use crate::prompts::PromptSet;
    use std::path::PathBuf;

    fn book_with_pages(pages: &[(u32, &str)], total: u32) -> Arc<BookState> {
        let state = Arc::new(BookState::new(
            "b1",
            "doc-b1",
            PathBuf::from("/tmp/book.pdf"),
            total,
            vec![],
            BookProviders {
                blend: "p".to_string(),
                label: "p".to_string(),
                metadata: "p".to_string(),
                toc: "p".to_string(),
            },
            PromptSet::embedded(),
        ));
        for (page, text) in pages {
            state.get_or_create_page(*page);
            state.update_page(*page, |p| p.blended_text = Some(text.to_string()));
        }
        state
    }

    #[tokio::test]
    async fn test_grep_clusters_nearby_pages() {
        let state = book_with_pages(
            &[
                (10, "Chapter One begins"),
                (11, "chapter one continued"),
                (50, "as we saw in chapter one"),
            ],
            100,
        );
        let ctx = ToolContext::new(state);

        let result = GrepTextTool
            .execute(json!({"query": "chapter one"}), &ctx)
            .await;
        assert!(!result.is_error);
        assert!(result.content.contains("pages 10-11 (2 matches)"));
        assert!(result.content.contains("page 50 (1 matches)"));
    }

    #[tokio::test]
    async fn test_grep_flags_back_matter() {
        let state = book_with_pages(&[(5, "Moby Dick"), (95, "Moby Dick, 5, 95")], 100);
        let ctx = ToolContext::new(state);

        let result = GrepTextTool.execute(json!({"query": "moby"}), &ctx).await;
        let lines: Vec<&str> = result.content.lines().collect();
        assert!(lines[0].starts_with("page 5"));
        assert!(!lines[0].contains("back matter"));
        assert!(result.content.contains("page 95 (1 matches) — in back matter"));
    }

    #[tokio::test]
    async fn test_grep_invalid_regex() {
        let state = book_with_pages(&[(1, "text")], 10);
        let ctx = ToolContext::new(state);

        let result = GrepTextTool.execute(json!({"query": "[unclosed"}), &ctx).await;
        assert!(result.is_error);
        assert!(result.content.contains("Invalid regex"));
    }

    #[tokio::test]
    async fn test_get_page_ocr_bounds_and_warning() {
        let state = book_with_pages(&[(95, "index entries here")], 100);
        let ctx = ToolContext::new(state);

        let result = GetPageOcrTool.execute(json!({"page_num": 95}), &ctx).await;
        assert!(!result.is_error);
        assert!(result.content.starts_with("note:"));
        assert!(result.content.contains("index entries here"));

        let result = GetPageOcrTool.execute(json!({"page_num": 101}), &ctx).await;
        assert!(result.is_error);

        let result = GetPageOcrTool.execute(json!({"page_num": 2}), &ctx).await;
        assert!(result.is_error);
        assert!(result.content.contains("no text yet"));
    }

    #[tokio::test]
    async fn test_executor_rejects_unknown_tool() {
        let state = book_with_pages(&[], 10);
        let ctx = ToolContext::new(state);
        let executor = ToolExecutor::page_tools();

        let call = ToolCall {
            id: "tu_1".to_string(),
            name: "write_file".to_string(),
            input: json!({}),
        };
        let result = executor.execute(&call, &ctx).await;
        assert!(result.is_error);
        assert!(result.content.contains("Unknown tool"));
    }

    #[test]
    fn test_executor_definitions() {
        let executor = ToolExecutor::page_tools();
        let defs = executor.definitions();
        let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["grep_text", "get_page_ocr"]);
    }
}
