//! Per-page pipeline state

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::ocr::OcrOutput;

/// Label extracted for a page by the label stage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageLabel {
    /// Printed page number as it appears on the page ("42", "xii"), if any
    pub page_label: Option<String>,

    /// Headings visible on the page
    #[serde(default)]
    pub headings: Vec<String>,

    /// Running header text, if any
    pub header: Option<String>,

    /// Running footer text, if any
    pub footer: Option<String>,

    /// Whether the page looks like part of a table of contents
    #[serde(default)]
    pub is_toc_page: bool,
}

/// State of one scan page as it moves through the pipeline
///
/// Stages only ever flip forward: extract, then one OCR result per
/// configured engine, then blend, then label.
#[derive(Debug, Clone, Default)]
pub struct PageState {
    /// Page number, 1-indexed
    pub page: u32,

    /// Store doc id of the page document
    pub doc_id: Option<String>,

    pub extract_done: bool,

    /// Rendered page image, set by extract
    pub image_path: Option<PathBuf>,

    /// Embedded PDF text layer, when present
    pub embedded_text: Option<String>,

    /// OCR results keyed by provider name
    pub ocr_results: HashMap<String, OcrOutput>,

    /// Fused text from all OCR engines
    pub blended_text: Option<String>,

    pub label: Option<PageLabel>,
}

impl PageState {
    /// Fresh page record
    pub fn new(page: u32) -> Self {
        Self {
            page,
            ..Default::default()
        }
    }

    /// Whether every named provider has a result for this page
    pub fn is_ocr_complete(&self, providers: &[String]) -> bool {
        providers.iter().all(|p| self.ocr_results.contains_key(p))
    }

    pub fn is_blend_done(&self) -> bool {
        self.blended_text.is_some()
    }

    pub fn is_label_done(&self) -> bool {
        self.label.is_some()
    }

    pub fn is_toc_page(&self) -> bool {
        self.label.as_ref().is_some_and(|l| l.is_toc_page)
    }

    /// Best available text for tool access: blended, else any OCR result,
    /// else the embedded text layer
    pub fn best_text(&self) -> Option<&str> {
        self.blended_text
            .as_deref()
            .or_else(|| self.ocr_results.values().next().map(|o| o.text.as_str()))
            .or(self.embedded_text.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ocr_complete_per_provider() {
        let providers = vec!["engA".to_string(), "engB".to_string()];
        let mut page = PageState::new(1);
        assert!(!page.is_ocr_complete(&providers));

        page.ocr_results.insert("engA".to_string(), OcrOutput::default());
        assert!(!page.is_ocr_complete(&providers));

        page.ocr_results.insert("engB".to_string(), OcrOutput::default());
        assert!(page.is_ocr_complete(&providers));
    }

    #[test]
    fn test_best_text_prefers_blend() {
        let mut page = PageState::new(1);
        assert!(page.best_text().is_none());

        page.embedded_text = Some("embedded".to_string());
        assert_eq!(page.best_text(), Some("embedded"));

        page.ocr_results.insert(
            "engA".to_string(),
            OcrOutput {
                text: "ocr".to_string(),
                ..Default::default()
            },
        );
        assert_eq!(page.best_text(), Some("ocr"));

        page.blended_text = Some("blended".to_string());
        assert_eq!(page.best_text(), Some("blended"));
    }

    #[test]
    fn test_label_flags() {
        let mut page = PageState::new(7);
        assert!(!page.is_label_done());
        assert!(!page.is_toc_page());

        page.label = Some(PageLabel {
            is_toc_page: true,
            ..Default::default()
        });
        assert!(page.is_label_done());
        assert!(page.is_toc_page());
    }
}
