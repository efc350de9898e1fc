//! LLM client trait and provider drivers

mod anthropic;
mod error;
mod types;

use async_trait::async_trait;

pub use anthropic::AnthropicClient;
pub use error::LlmError;
pub use types::{
    ChatRequest, ChatResult, ContentBlock, Message, MessageContent, Role, StopReason, TokenUsage, ToolCall,
    ToolDefinition,
};

/// Trait for LLM providers
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Execute one chat completion
    async fn complete(&self, request: ChatRequest) -> Result<ChatResult, LlmError>;

    /// Model identifier used for cost attribution
    fn model(&self) -> &str;
}
