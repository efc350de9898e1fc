//! Provider registry - named LLM and OCR clients plus their limits
//!
//! Work units name a provider; the scheduler resolves it here to pick the
//! pool and the driver. Unknown LLM providers fail the unit instead of
//! blocking the pipeline.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::llm::LlmClient;
use crate::ocr::OcrClient;

/// Per-provider dispatch limits, applied at the pool edge
#[derive(Debug, Clone)]
pub struct ProviderLimits {
    /// Max in-flight calls
    pub max_concurrent: usize,

    /// Max calls per rate window
    pub max_requests_per_window: u32,

    pub rate_window_secs: u64,
}

impl Default for ProviderLimits {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            max_requests_per_window: 60,
            rate_window_secs: 60,
        }
    }
}

/// One rasterized page handed back by the host's PDF layer
#[derive(Debug, Clone)]
pub struct ExtractedPage {
    /// Path to the rendered page image
    pub image_path: PathBuf,

    /// Embedded text layer, when the PDF has one
    pub embedded_text: Option<String>,
}

/// Host-provided PDF page access
///
/// Rasterization details are outside the engine; extraction runs on the
/// CPU pool through this trait.
#[async_trait]
pub trait PageExtractor: Send + Sync {
    /// Number of pages in the PDF
    async fn page_count(&self, pdf_path: &Path) -> eyre::Result<u32>;

    /// Rasterize one page (1-indexed) and return its image path
    async fn extract_page(&self, pdf_path: &Path, page: u32) -> eyre::Result<ExtractedPage>;
}

/// Registry of named providers
pub struct ProviderRegistry {
    llm: HashMap<String, (Arc<dyn LlmClient>, ProviderLimits)>,
    ocr: HashMap<String, (Arc<dyn OcrClient>, ProviderLimits)>,
}

impl ProviderRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            llm: HashMap::new(),
            ocr: HashMap::new(),
        }
    }

    /// Register an LLM provider under a name
    pub fn register_llm(&mut self, name: impl Into<String>, client: Arc<dyn LlmClient>, limits: ProviderLimits) {
        self.llm.insert(name.into(), (client, limits));
    }

    /// Register an OCR provider under a name
    pub fn register_ocr(&mut self, name: impl Into<String>, client: Arc<dyn OcrClient>, limits: ProviderLimits) {
        self.ocr.insert(name.into(), (client, limits));
    }

    /// Look up an LLM provider
    pub fn llm(&self, name: &str) -> Option<Arc<dyn LlmClient>> {
        self.llm.get(name).map(|(client, _)| client.clone())
    }

    /// Look up an OCR provider
    pub fn ocr(&self, name: &str) -> Option<Arc<dyn OcrClient>> {
        self.ocr.get(name).map(|(client, _)| client.clone())
    }

    /// Registered LLM provider names with their limits
    pub fn llm_providers(&self) -> impl Iterator<Item = (&str, &ProviderLimits)> {
        self.llm.iter().map(|(name, (_, limits))| (name.as_str(), limits))
    }

    /// Registered OCR provider names with their limits
    pub fn ocr_providers(&self) -> impl Iterator<Item = (&str, &ProviderLimits)> {
        self.ocr.iter().map(|(name, (_, limits))| (name.as_str(), limits))
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatRequest, ChatResult, LlmError};

    struct NullLlm;

    #[async_trait]
    impl LlmClient for NullLlm {
        async fn complete(&self, _request: ChatRequest) -> Result<ChatResult, LlmError> {
            Ok(ChatResult::default())
        }

        fn model(&self) -> &str {
            "null"
        }
    }

    #[test]
    fn test_lookup_by_name() {
        let mut registry = ProviderRegistry::new();
        registry.register_llm("anthropic", Arc::new(NullLlm), ProviderLimits::default());

        assert!(registry.llm("anthropic").is_some());
        assert!(registry.llm("unknown").is_none());
        assert!(registry.ocr("anthropic").is_none());
    }

    #[test]
    fn test_provider_iteration() {
        let mut registry = ProviderRegistry::new();
        registry.register_llm(
            "anthropic",
            Arc::new(NullLlm),
            ProviderLimits {
                max_concurrent: 8,
                ..Default::default()
            },
        );

        let providers: Vec<_> = registry.llm_providers().collect();
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].1.max_concurrent, 8);
    }
}
