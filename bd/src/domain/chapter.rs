//! Chapter records built by the structure subsystem

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Which part of the book a chapter belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatterType {
    Front,
    Body,
    Back,
}

/// One chapter of the structured book
#[derive(Debug, Clone, Default)]
pub struct ChapterState {
    /// Store doc id; empty until first persisted
    pub doc_id: Option<String>,

    /// Stable upsert key, preserves doc ids across re-runs
    pub unique_key: String,

    pub title: String,

    pub level: u32,

    pub start_page: u32,

    pub end_page: u32,

    /// Index of the parent chapter in the chapter sequence; an index, not
    /// a pointer, so the list stays serializable
    pub parent_index: Option<usize>,

    /// ToC entry this chapter was built from
    pub toc_entry_id: Option<String>,

    pub sort_order: i64,

    /// Merged page text, header/footer stripped
    pub mechanical_text: Option<String>,

    pub word_count: u32,

    pub matter_type: Option<MatterType>,

    /// Classifier's content kind ("chapter", "preface", "index", ...)
    pub content_type: Option<String>,

    /// Whether this chapter belongs in audio output
    pub audio_include: bool,

    pub polished_text: Option<String>,

    /// Polish degraded to mechanical text after repeated failures
    pub polish_failed: bool,
}

impl ChapterState {
    /// Stable key for a chapter built from a ToC entry
    pub fn entry_key(book_id: &str, toc_entry_id: &str) -> String {
        format!("{book_id}:{toc_entry_id}")
    }

    /// Stable key for a chapter with no backing entry
    pub fn orphan_key(book_id: &str, sort_order: i64) -> String {
        format!("{book_id}:orphan:{sort_order}")
    }

    /// Persisted body for upserts
    pub fn to_body(&self, book_id: &str) -> Value {
        json!({
            "book_id": book_id,
            "unique_key": self.unique_key,
            "title": self.title,
            "level": self.level,
            "start_page": self.start_page,
            "end_page": self.end_page,
            "parent_index": self.parent_index,
            "toc_entry_id": self.toc_entry_id,
            "sort_order": self.sort_order,
            "mechanical_text": self.mechanical_text,
            "word_count": self.word_count,
            "matter_type": self.matter_type,
            "content_type": self.content_type,
            "audio_include": self.audio_include,
            "polished_text": self.polished_text,
            "polish_failed": self.polish_failed,
        })
    }

    /// Rebuild from a persisted document
    pub fn from_doc(doc_id: &str, body: &Value) -> Self {
        Self {
            doc_id: Some(doc_id.to_string()),
            unique_key: body["unique_key"].as_str().unwrap_or_default().to_string(),
            title: body["title"].as_str().unwrap_or_default().to_string(),
            level: body["level"].as_u64().unwrap_or(0) as u32,
            start_page: body["start_page"].as_u64().unwrap_or(0) as u32,
            end_page: body["end_page"].as_u64().unwrap_or(0) as u32,
            parent_index: body["parent_index"].as_u64().map(|i| i as usize),
            toc_entry_id: body["toc_entry_id"].as_str().map(String::from),
            sort_order: body["sort_order"].as_i64().unwrap_or(0),
            mechanical_text: body["mechanical_text"].as_str().map(String::from),
            word_count: body["word_count"].as_u64().unwrap_or(0) as u32,
            matter_type: serde_json::from_value(body["matter_type"].clone()).ok(),
            content_type: body["content_type"].as_str().map(String::from),
            audio_include: body["audio_include"].as_bool().unwrap_or(false),
            polished_text: body["polished_text"].as_str().map(String::from),
            polish_failed: body["polish_failed"].as_bool().unwrap_or(false),
        }
    }
}
