//! Tool-loop agent runtime
//!
//! Drives a multi-turn, tool-using conversation toward a structured
//! result. Unlike a run-to-completion loop, each LLM turn is a work unit
//! dispatched through the scheduler: `next_request` emits the call, the
//! job feeds the result back through `handle_llm_result`, which executes
//! any tool calls locally and leaves the agent ready for the next turn.
//! The whole conversation checkpoints between turns.

use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::llm::{ChatRequest, ChatResult, ContentBlock, Message, ToolCall};

use super::state::{AgentState, AgentType, SavedToolResult};
use super::tools::{ToolContext, ToolExecutor};

/// Agent phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentPhase {
    /// Ready to produce the next LLM call
    Running,
    /// An LLM work unit is in flight
    AwaitingLlm,
    /// Executing tool calls locally
    ExecutingTools,
    /// Terminal; check `success`
    Done,
}

/// What a handled LLM result means for the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStep {
    /// Call `next_request` for the next turn
    Continue,
    /// Terminal; read the result
    Done,
}

/// Iteration and tool budgets
#[derive(Debug, Clone, Copy)]
pub struct AgentBudgets {
    pub max_iterations: u32,
    pub max_tool_calls: u32,
}

impl Default for AgentBudgets {
    fn default() -> Self {
        Self {
            max_iterations: 12,
            max_tool_calls: 40,
        }
    }
}

/// A checkpointable tool-loop agent
pub struct ToolLoopAgent {
    agent_id: String,
    agent_type: AgentType,
    instance_key: String,
    system_prompt: String,
    /// Schema of the final structured answer
    schema: Value,
    executor: ToolExecutor,
    budgets: AgentBudgets,

    messages: Vec<Message>,
    phase: AgentPhase,
    iteration: u32,
    tool_calls_made: u32,
    success: bool,
    result_json: Option<Value>,
    pending_tool_calls: Vec<ToolCall>,
    tool_results: Vec<SavedToolResult>,
}

impl ToolLoopAgent {
    /// Fresh agent with one initial user message
    pub fn new(
        agent_type: AgentType,
        instance_key: impl Into<String>,
        system_prompt: impl Into<String>,
        initial_message: impl Into<String>,
        schema: Value,
        executor: ToolExecutor,
        budgets: AgentBudgets,
    ) -> Self {
        Self {
            agent_id: Uuid::new_v4().to_string(),
            agent_type,
            instance_key: instance_key.into(),
            system_prompt: system_prompt.into(),
            schema,
            executor,
            budgets,
            messages: vec![Message::user(initial_message)],
            phase: AgentPhase::Running,
            iteration: 0,
            tool_calls_made: 0,
            success: false,
            result_json: None,
            pending_tool_calls: Vec::new(),
            tool_results: Vec::new(),
        }
    }

    pub fn agent_type(&self) -> AgentType {
        self.agent_type
    }

    pub fn instance_key(&self) -> &str {
        &self.instance_key
    }

    pub fn phase(&self) -> AgentPhase {
        self.phase
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn is_done(&self) -> bool {
        self.phase == AgentPhase::Done
    }

    pub fn success(&self) -> bool {
        self.success
    }

    /// The structured answer, when done successfully
    pub fn result_json(&self) -> Option<&Value> {
        self.result_json.as_ref()
    }

    /// Produce the next LLM call, or None when the agent is finished
    ///
    /// Exceeding the iteration budget finishes the agent unsuccessfully.
    pub fn next_request(&mut self) -> Option<ChatRequest> {
        if self.phase == AgentPhase::Done {
            return None;
        }

        if self.iteration >= self.budgets.max_iterations {
            warn!(
                agent = %self.agent_type,
                key = %self.instance_key,
                iterations = self.iteration,
                "Iteration budget exhausted"
            );
            self.finish(false);
            return None;
        }

        self.iteration += 1;
        self.phase = AgentPhase::AwaitingLlm;

        Some(ChatRequest {
            system_prompt: self.system_prompt.clone(),
            messages: self.messages.clone(),
            tools: self.executor.definitions(),
            response_schema: Some(self.schema.clone()),
            model_hint: None,
            max_tokens: 8192,
            temperature: None,
        })
    }

    /// Consume one LLM result: record the answer, or execute tool calls
    /// and prepare the next turn
    pub async fn handle_llm_result(&mut self, result: &ChatResult, ctx: &ToolContext) -> AgentStep {
        if self.phase == AgentPhase::Done {
            return AgentStep::Done;
        }

        self.messages.push(build_assistant_message(result));

        // The record_result tool was called: structured answer in hand
        if let Some(json) = &result.parsed_json {
            debug!(agent = %self.agent_type, key = %self.instance_key, "Agent recorded result");
            self.result_json = Some(json.clone());
            self.finish(true);
            return AgentStep::Done;
        }

        if result.tool_calls.is_empty() {
            // Neither an answer nor tool use; nudge and let the iteration
            // budget bound the conversation
            self.messages.push(Message::user(
                "Record your final answer with the record_result tool, or keep investigating with the available tools.",
            ));
            self.phase = AgentPhase::Running;
            return AgentStep::Continue;
        }

        self.phase = AgentPhase::ExecutingTools;
        self.pending_tool_calls = result.tool_calls.clone();

        let mut blocks = Vec::with_capacity(result.tool_calls.len());
        for call in &result.tool_calls {
            if self.tool_calls_made >= self.budgets.max_tool_calls {
                warn!(
                    agent = %self.agent_type,
                    key = %self.instance_key,
                    tool_calls = self.tool_calls_made,
                    "Tool-call budget exhausted"
                );
                self.finish(false);
                return AgentStep::Done;
            }
            self.tool_calls_made += 1;

            let tool_result = self.executor.execute(call, ctx).await;
            self.tool_results.push(SavedToolResult {
                tool_use_id: call.id.clone(),
                content: tool_result.content.clone(),
                is_error: tool_result.is_error,
            });
            blocks.push(ContentBlock::tool_result(
                call.id.clone(),
                tool_result.content,
                tool_result.is_error,
            ));
        }

        self.messages.push(Message::user_blocks(blocks));
        self.pending_tool_calls.clear();
        self.tool_results.clear();
        self.phase = AgentPhase::Running;
        AgentStep::Continue
    }

    fn finish(&mut self, success: bool) {
        self.phase = AgentPhase::Done;
        self.success = success;
        self.pending_tool_calls.clear();
        self.tool_results.clear();
    }

    /// Serializable snapshot for persistence
    pub fn export_state(&self) -> AgentState {
        AgentState {
            agent_id: self.agent_id.clone(),
            agent_type: self.agent_type,
            instance_key: self.instance_key.clone(),
            iteration: self.iteration,
            tool_calls_made: self.tool_calls_made,
            complete: self.phase == AgentPhase::Done,
            success: self.success,
            messages: self.messages.clone(),
            pending_tool_calls: self.pending_tool_calls.clone(),
            tool_results: self.tool_results.clone(),
            result_json: self.result_json.clone(),
        }
    }

    /// Rehydrate from a saved snapshot; the conversation picks up exactly
    /// where the checkpoint left it
    pub fn restore_state(&mut self, state: &AgentState) {
        self.agent_id = state.agent_id.clone();
        self.iteration = state.iteration;
        self.tool_calls_made = state.tool_calls_made;
        self.success = state.success;
        self.messages = state.messages.clone();
        self.pending_tool_calls = state.pending_tool_calls.clone();
        self.tool_results = state.tool_results.clone();
        self.result_json = state.result_json.clone();
        self.phase = if state.complete { AgentPhase::Done } else { AgentPhase::Running };
    }
}

fn build_assistant_message(result: &ChatResult) -> Message {
    let mut blocks = Vec::new();

    if let Some(text) = &result.content {
        blocks.push(ContentBlock::text(text.clone()));
    }

    for call in &result.tool_calls {
        blocks.push(ContentBlock::ToolUse {
            id: call.id.clone(),
            name: call.name.clone(),
            input: call.input.clone(),
        });
    }

    if blocks.is_empty() {
        Message::assistant(String::new())
    } else {
        Message::assistant_blocks(blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BookProviders, BookState};
    use crate::llm::StopReason;
    use crate::prompts::PromptSet;
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn test_ctx() -> ToolContext {
        let state = Arc::new(BookState::new(
            "b1",
            "doc-b1",
            PathBuf::from("/tmp/book.pdf"),
            100,
            vec![],
            BookProviders {
                blend: "p".to_string(),
                label: "p".to_string(),
                metadata: "p".to_string(),
                toc: "p".to_string(),
            },
            PromptSet::embedded(),
        ));
        state.get_or_create_page(4);
        state.update_page(4, |p| p.blended_text = Some("Contents\nChapter 1 ... 9".to_string()));
        ToolContext::new(state)
    }

    fn test_agent() -> ToolLoopAgent {
        ToolLoopAgent::new(
            AgentType::TocFinder,
            "toc",
            "find the toc",
            "The book has 100 pages.",
            json!({"type": "object"}),
            ToolExecutor::page_tools(),
            AgentBudgets::default(),
        )
    }

    fn tool_call_result(calls: Vec<ToolCall>) -> ChatResult {
        ChatResult {
            content: Some("checking".to_string()),
            parsed_json: None,
            tool_calls: calls,
            stop_reason: StopReason::ToolUse,
            usage: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_tool_loop_round() {
        let ctx = test_ctx();
        let mut agent = test_agent();

        let request = agent.next_request().unwrap();
        assert_eq!(agent.phase(), AgentPhase::AwaitingLlm);
        assert_eq!(request.messages.len(), 1);
        assert_eq!(request.tools.len(), 2);

        let step = agent
            .handle_llm_result(
                &tool_call_result(vec![ToolCall {
                    id: "tu_1".to_string(),
                    name: "get_page_ocr".to_string(),
                    input: json!({"page_num": 4}),
                }]),
                &ctx,
            )
            .await;
        assert_eq!(step, AgentStep::Continue);
        assert_eq!(agent.phase(), AgentPhase::Running);

        // Next turn carries assistant + tool results
        let request = agent.next_request().unwrap();
        assert_eq!(request.messages.len(), 3);
        assert_eq!(agent.iteration(), 2);
    }

    #[tokio::test]
    async fn test_structured_answer_completes() {
        let ctx = test_ctx();
        let mut agent = test_agent();
        agent.next_request();

        let result = ChatResult {
            parsed_json: Some(json!({"found": true, "start_page": 4, "end_page": 5})),
            ..Default::default()
        };
        let step = agent.handle_llm_result(&result, &ctx).await;
        assert_eq!(step, AgentStep::Done);
        assert!(agent.is_done());
        assert!(agent.success());
        assert_eq!(agent.result_json().unwrap()["start_page"], 4);
        assert!(agent.next_request().is_none());
    }

    #[tokio::test]
    async fn test_iteration_budget_fails_agent() {
        let ctx = test_ctx();
        let mut agent = ToolLoopAgent::new(
            AgentType::TocFinder,
            "toc",
            "sys",
            "user",
            json!({}),
            ToolExecutor::page_tools(),
            AgentBudgets {
                max_iterations: 2,
                max_tool_calls: 40,
            },
        );

        for _ in 0..2 {
            assert!(agent.next_request().is_some());
            let step = agent
                .handle_llm_result(&tool_call_result(vec![]), &ctx)
                .await;
            assert_eq!(step, AgentStep::Continue);
        }

        assert!(agent.next_request().is_none());
        assert!(agent.is_done());
        assert!(!agent.success());
    }

    #[tokio::test]
    async fn test_tool_call_budget_fails_agent() {
        let ctx = test_ctx();
        let mut agent = ToolLoopAgent::new(
            AgentType::TocFinder,
            "toc",
            "sys",
            "user",
            json!({}),
            ToolExecutor::page_tools(),
            AgentBudgets {
                max_iterations: 100,
                max_tool_calls: 1,
            },
        );

        agent.next_request();
        let calls = vec![
            ToolCall {
                id: "tu_1".to_string(),
                name: "get_page_ocr".to_string(),
                input: json!({"page_num": 4}),
            },
            ToolCall {
                id: "tu_2".to_string(),
                name: "get_page_ocr".to_string(),
                input: json!({"page_num": 4}),
            },
        ];
        let step = agent.handle_llm_result(&tool_call_result(calls), &ctx).await;
        assert_eq!(step, AgentStep::Done);
        assert!(!agent.success());
    }

    #[tokio::test]
    async fn test_export_restore_round_trip() {
        let ctx = test_ctx();
        let mut agent = test_agent();
        agent.next_request();
        agent
            .handle_llm_result(
                &tool_call_result(vec![ToolCall {
                    id: "tu_1".to_string(),
                    name: "grep_text".to_string(),
                    input: json!({"query": "contents"}),
                }]),
                &ctx,
            )
            .await;

        let exported = agent.export_state();
        assert!(!exported.complete);
        assert_eq!(exported.iteration, 1);

        let mut restored = test_agent();
        restored.restore_state(&exported);

        // export . restore = identity on the snapshot
        let re_exported = restored.export_state();
        assert_eq!(
            serde_json::to_value(&exported).unwrap(),
            serde_json::to_value(&re_exported).unwrap()
        );

        // The rehydrated agent continues the same conversation: its next
        // request carries the prior turns, not a fresh one
        let request = restored.next_request().unwrap();
        assert_eq!(request.messages.len(), exported.messages.len());
        assert!(request.messages.len() > 1);
    }
}
