//! Prompt loader
//!
//! Resolves each prompt key to template text (file override or embedded
//! default) and computes its CID once.

use std::collections::HashMap;
use std::path::Path;

use eyre::{Result, WrapErr};
use handlebars::Handlebars;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::embedded;

/// A resolved prompt template
#[derive(Debug, Clone)]
pub struct Prompt {
    /// Template text (handlebars)
    pub text: String,

    /// Content address of the template text (hex sha-256)
    pub cid: String,
}

impl Prompt {
    fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let cid = format!("{:x}", Sha256::digest(text.as_bytes()));
        Self { text, cid }
    }
}

/// All prompt keys the engine uses
pub const PROMPT_KEYS: &[&str] = &[
    "blend",
    "label",
    "metadata",
    "toc_find_system",
    "toc_extract",
    "entry_find_system",
    "pattern_page_numbers",
    "pattern_chapters",
    "pattern_boundaries",
    "finalize_pattern",
    "chapter_find_system",
    "gap_investigate_system",
    "chapter_classify",
    "chapter_polish",
];

fn embedded_text(key: &str) -> &'static str {
    match key {
        "blend" => embedded::BLEND,
        "label" => embedded::LABEL,
        "metadata" => embedded::METADATA,
        "toc_find_system" => embedded::TOC_FIND_SYSTEM,
        "toc_extract" => embedded::TOC_EXTRACT,
        "entry_find_system" => embedded::ENTRY_FIND_SYSTEM,
        "pattern_page_numbers" => embedded::PATTERN_PAGE_NUMBERS,
        "pattern_chapters" => embedded::PATTERN_CHAPTERS,
        "pattern_boundaries" => embedded::PATTERN_BOUNDARIES,
        "finalize_pattern" => embedded::FINALIZE_PATTERN,
        "chapter_find_system" => embedded::CHAPTER_FIND_SYSTEM,
        "gap_investigate_system" => embedded::GAP_INVESTIGATE_SYSTEM,
        "chapter_classify" => embedded::CHAPTER_CLASSIFY,
        "chapter_polish" => embedded::CHAPTER_POLISH,
        _ => "",
    }
}

/// The resolved prompt mapping for a book run
#[derive(Debug, Clone)]
pub struct PromptSet {
    prompts: HashMap<String, Prompt>,
}

impl PromptSet {
    /// Embedded defaults only
    pub fn embedded() -> Self {
        let prompts = PROMPT_KEYS
            .iter()
            .map(|&key| (key.to_string(), Prompt::new(embedded_text(key))))
            .collect();
        Self { prompts }
    }

    /// Load with an optional directory override
    ///
    /// A file `<dir>/<key>.hbs` replaces the embedded default for that key.
    pub fn load(template_dir: Option<&Path>) -> Result<Self> {
        let mut set = Self::embedded();

        if let Some(dir) = template_dir {
            for &key in PROMPT_KEYS {
                let path = dir.join(format!("{key}.hbs"));
                if path.is_file() {
                    let text = std::fs::read_to_string(&path)
                        .wrap_err_with(|| format!("failed to read prompt template {}", path.display()))?;
                    debug!(key, path = %path.display(), "Loaded prompt override");
                    set.prompts.insert(key.to_string(), Prompt::new(text));
                }
            }
        }

        Ok(set)
    }

    /// The resolved prompt for a key
    pub fn get(&self, key: &str) -> Option<&Prompt> {
        self.prompts.get(key)
    }

    /// CID of a prompt, for metrics attribution
    pub fn cid(&self, key: &str) -> Option<String> {
        self.prompts.get(key).map(|p| p.cid.clone())
    }

    /// Render a prompt with the given context
    pub fn render<T: Serialize>(&self, key: &str, context: &T) -> Result<String> {
        let prompt = self
            .prompts
            .get(key)
            .ok_or_else(|| eyre::eyre!("unknown prompt key: {key}"))?;

        let mut handlebars = Handlebars::new();
        handlebars.register_escape_fn(handlebars::no_escape);
        handlebars
            .render_template(&prompt.text, context)
            .wrap_err_with(|| format!("failed to render prompt {key}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_embedded_covers_all_keys() {
        let set = PromptSet::embedded();
        for &key in PROMPT_KEYS {
            let prompt = set.get(key).unwrap();
            assert!(!prompt.text.is_empty(), "empty embedded prompt for {key}");
            assert_eq!(prompt.cid.len(), 64);
        }
    }

    #[test]
    fn test_render_substitutes_context() {
        let set = PromptSet::embedded();
        let rendered = set
            .render("toc_find_system", &json!({"total_pages": 320}))
            .unwrap();
        assert!(rendered.contains("320 pages"));
    }

    #[test]
    fn test_render_iterates_collections() {
        let set = PromptSet::embedded();
        let rendered = set
            .render(
                "toc_extract",
                &json!({"pages": [
                    {"page": 4, "text": "Contents"},
                    {"page": 5, "text": "Chapter 1 ... 9"},
                ]}),
            )
            .unwrap();
        assert!(rendered.contains("=== Page 4 ==="));
        assert!(rendered.contains("Chapter 1 ... 9"));
    }

    #[test]
    fn test_directory_override() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("blend.hbs"), "custom blend {{ocr_count}}").unwrap();

        let set = PromptSet::load(Some(temp.path())).unwrap();
        let rendered = set.render("blend", &json!({"ocr_count": 2})).unwrap();
        assert_eq!(rendered, "custom blend 2");

        // Untouched keys keep their embedded text
        let embedded = PromptSet::embedded();
        assert_eq!(set.cid("label"), embedded.cid("label"));
        assert_ne!(set.cid("blend"), embedded.cid("blend"));
    }
}
