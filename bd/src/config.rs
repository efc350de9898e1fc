//! Configuration types and loading

use std::collections::HashMap;
use std::path::PathBuf;

use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// LLM providers by name
    pub llm: HashMap<String, LlmProviderConfig>,

    /// OCR providers by name
    pub ocr: HashMap<String, OcrProviderConfig>,

    pub engine: EngineConfig,

    pub store: StoreConfig,

    pub prompts: PromptConfig,
}

impl Config {
    /// Load from an explicit path, or the default location
    pub fn load(path: Option<&std::path::Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_path(),
        };

        if !path.is_file() {
            return Ok(Self::default());
        }

        let text =
            std::fs::read_to_string(&path).wrap_err_with(|| format!("failed to read config {}", path.display()))?;
        serde_yaml::from_str(&text).wrap_err_with(|| format!("failed to parse config {}", path.display()))
    }
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("bindery")
        .join("config.yaml")
}

/// One LLM provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmProviderConfig {
    pub base_url: String,

    pub model: String,

    /// Environment variable holding the API key
    pub api_key_env: String,

    pub timeout_ms: u64,

    pub max_tokens: u32,

    pub max_concurrent: usize,

    pub max_requests_per_window: u32,

    pub rate_window_secs: u64,
}

impl Default for LlmProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com".to_string(),
            model: "claude-sonnet-4-5".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            timeout_ms: 300_000,
            max_tokens: 8192,
            max_concurrent: 4,
            max_requests_per_window: 60,
            rate_window_secs: 60,
        }
    }
}

/// One OCR provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrProviderConfig {
    pub endpoint: String,

    /// Environment variable holding the API key, if the endpoint needs one
    pub api_key_env: Option<String>,

    pub timeout_ms: u64,

    pub max_concurrent: usize,

    pub max_requests_per_window: u32,

    pub rate_window_secs: u64,
}

impl Default for OcrProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key_env: None,
            timeout_ms: 120_000,
            max_concurrent: 4,
            max_requests_per_window: 120,
            rate_window_secs: 60,
        }
    }
}

/// Engine behavior: retry budgets, gating thresholds, agent budgets
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Retry budget for page units (extract, ocr, blend, label)
    pub max_page_op_retries: u32,

    /// Failure budget for book operations
    pub max_book_op_retries: u32,

    /// Per-entry / per-gap agent retry budget in link and finalize
    pub max_finalize_retries: u32,

    /// Labeled pages required before metadata starts
    pub label_threshold_for_book_ops: u32,

    /// Leading pages that must blend before the ToC finder starts
    pub consecutive_front_matter_required: u32,

    /// Minimum page-interval length that counts as a finalize gap
    pub min_gap_size: u32,

    /// Agent iteration budget
    pub agent_max_iterations: u32,

    /// Agent total tool-call budget
    pub agent_max_tool_calls: u32,

    /// OCR engines every page must pass through
    pub ocr_providers: Vec<String>,

    /// LLM provider for each book operation family
    pub blend_provider: String,
    pub label_provider: String,
    pub metadata_provider: String,
    pub toc_provider: String,

    /// CPU pool size; None uses hardware parallelism
    pub cpu_pool_size: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_page_op_retries: 3,
            max_book_op_retries: 2,
            max_finalize_retries: 3,
            label_threshold_for_book_ops: 10,
            consecutive_front_matter_required: 15,
            min_gap_size: 10,
            agent_max_iterations: 12,
            agent_max_tool_calls: 40,
            ocr_providers: vec!["tesseract".to_string()],
            blend_provider: "anthropic".to_string(),
            label_provider: "anthropic".to_string(),
            metadata_provider: "anthropic".to_string(),
            toc_provider: "anthropic".to_string(),
            cpu_pool_size: None,
        }
    }
}

/// Store location
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub database_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("bindery")
                .join("documents.db"),
        }
    }
}

/// Prompt template overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    /// Directory of `<key>.hbs` overrides
    pub template_dir: Option<PathBuf>,
}
