//! Table-of-contents records and finalize bookkeeping

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Where a ToC entry came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntrySource {
    /// Extracted from the printed table of contents
    #[default]
    Toc,
    /// Found by a chapter-finder agent during finalize discovery
    Discovered,
    /// Added or corrected by a gap investigator
    Validated,
}

impl std::fmt::Display for EntrySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Toc => write!(f, "toc"),
            Self::Discovered => write!(f, "discovered"),
            Self::Validated => write!(f, "validated"),
        }
    }
}

/// One table-of-contents entry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TocEntry {
    /// Store doc id; empty until first persisted
    pub doc_id: String,

    /// Stable upsert key
    pub unique_key: String,

    pub title: String,

    /// Nesting depth, 0 = top level
    pub level: u32,

    /// Structural identifier when the title follows a pattern
    /// ("chapter 2" -> "2")
    pub identifier: Option<String>,

    /// Page label printed in the ToC ("42", "xii")
    pub printed_page: Option<String>,

    /// Resolved scan page number
    pub actual_page: Option<u32>,

    /// Doc id of the resolved page document
    pub actual_page_id: Option<String>,

    pub sort_order: i64,

    pub source: EntrySource,
}

impl TocEntry {
    /// An entry is linked once it points at a real page document
    pub fn is_linked(&self) -> bool {
        self.actual_page_id.is_some()
    }

    /// Persisted body for upserts
    pub fn to_body(&self, book_id: &str, toc_doc_id: &str) -> Value {
        json!({
            "book_id": book_id,
            "toc_id": toc_doc_id,
            "unique_key": self.unique_key,
            "title": self.title,
            "level": self.level,
            "identifier": self.identifier,
            "printed_page": self.printed_page,
            "actual_page": self.actual_page,
            "actual_page_id": self.actual_page_id,
            "sort_order": self.sort_order,
            "source": self.source,
        })
    }

    /// Rebuild from a persisted document
    pub fn from_doc(doc_id: &str, body: &Value) -> Self {
        Self {
            doc_id: doc_id.to_string(),
            unique_key: body["unique_key"].as_str().unwrap_or_default().to_string(),
            title: body["title"].as_str().unwrap_or_default().to_string(),
            level: body["level"].as_u64().unwrap_or(0) as u32,
            identifier: body["identifier"].as_str().map(String::from),
            printed_page: body["printed_page"].as_str().map(String::from),
            actual_page: body["actual_page"].as_u64().map(|p| p as u32),
            actual_page_id: body["actual_page_id"].as_str().map(String::from),
            sort_order: body["sort_order"].as_i64().unwrap_or(0),
            source: serde_json::from_value(body["source"].clone()).unwrap_or_default(),
        }
    }
}

/// Result of the ToC finder
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TocInfo {
    /// Store doc id of the ToC document
    pub doc_id: Option<String>,

    pub found: bool,

    pub start_page: Option<u32>,

    pub end_page: Option<u32>,
}

/// A chapter expected to exist but absent from the linked entries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryToFind {
    /// Stable key within the book ("chapter_2")
    pub key: String,

    /// Structural level name ("chapter", "part")
    pub level_name: String,

    /// Identifier within the level ("2")
    pub identifier: String,
}

impl EntryToFind {
    pub fn new(level_name: &str, identifier: &str) -> Self {
        Self {
            key: format!("{level_name}_{identifier}"),
            level_name: level_name.to_string(),
            identifier: identifier.to_string(),
        }
    }
}

/// An unexplained page interval between linked entries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeGap {
    /// Stable key within the book ("gap_40_55")
    pub key: String,

    pub start_page: u32,

    pub end_page: u32,
}

impl FinalizeGap {
    pub fn new(start_page: u32, end_page: u32) -> Self {
        Self {
            key: format!("gap_{start_page}_{end_page}"),
            start_page,
            end_page,
        }
    }

    pub fn len(&self) -> u32 {
        self.end_page.saturating_sub(self.start_page)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Finalize sub-phase tag, persisted on the book document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizePhase {
    #[default]
    NotStarted,
    Pattern,
    Discover,
    Validate,
    Done,
}

impl std::fmt::Display for FinalizePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Pattern => write!(f, "pattern"),
            Self::Discover => write!(f, "discover"),
            Self::Validate => write!(f, "validate"),
            Self::Done => write!(f, "done"),
        }
    }
}

/// A structural pattern with an identifier range ("chapter 1..20")
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredPattern {
    pub level_name: String,

    pub range_start: u32,

    pub range_end: u32,
}

impl DiscoveredPattern {
    /// Identifiers covered by the range, as strings
    pub fn identifiers(&self) -> impl Iterator<Item = String> + '_ {
        (self.range_start..=self.range_end).map(|n| n.to_string())
    }
}

/// A page range ineligible to contain chapter starts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExcludedRange {
    pub start_page: u32,

    pub end_page: u32,

    /// "front_matter" or "back_matter"
    pub reason: String,
}

impl ExcludedRange {
    pub fn contains(&self, page: u32) -> bool {
        page >= self.start_page && page <= self.end_page
    }

    pub fn intersects(&self, start: u32, end: u32) -> bool {
        start <= self.end_page && end >= self.start_page
    }
}

/// Result of the finalize pattern phase
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FinalizePatternResult {
    #[serde(default)]
    pub patterns: Vec<DiscoveredPattern>,

    #[serde(default)]
    pub excluded: Vec<ExcludedRange>,

    #[serde(default)]
    pub reasoning: String,
}

/// Aggregated result of the three pattern-analysis sub-units
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatternAnalysisResult {
    /// How printed page numbers behave ("arabic from page 9", ...)
    #[serde(default)]
    pub page_number_pattern: String,

    /// First body page of the scan
    pub body_start: Option<u32>,

    /// Last body page of the scan
    pub body_end: Option<u32>,

    /// Chapter heading patterns observed ("Chapter N", "Part N", ...)
    #[serde(default)]
    pub chapter_patterns: Vec<String>,

    #[serde(default)]
    pub reasoning: String,
}

/// What a gap investigator decided
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixType {
    AddEntry,
    CorrectEntry,
    FlagForReview,
    NoFixNeeded,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_body_round_trip() {
        let entry = TocEntry {
            doc_id: "e1".to_string(),
            unique_key: "toc1:toc:3".to_string(),
            title: "Chapter 3".to_string(),
            level: 1,
            identifier: Some("3".to_string()),
            printed_page: Some("50".to_string()),
            actual_page: Some(58),
            actual_page_id: Some("p58".to_string()),
            sort_order: 300,
            source: EntrySource::Toc,
        };

        let body = entry.to_body("b1", "toc1");
        let back = TocEntry::from_doc("e1", &body);
        assert_eq!(back.title, "Chapter 3");
        assert_eq!(back.actual_page, Some(58));
        assert_eq!(back.sort_order, 300);
        assert_eq!(back.source, EntrySource::Toc);
        assert!(back.is_linked());
    }

    #[test]
    fn test_pattern_identifier_expansion() {
        let pattern = DiscoveredPattern {
            level_name: "chapter".to_string(),
            range_start: 1,
            range_end: 3,
        };
        let ids: Vec<String> = pattern.identifiers().collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[test]
    fn test_excluded_range_intersection() {
        let range = ExcludedRange {
            start_page: 1,
            end_page: 8,
            reason: "front_matter".to_string(),
        };
        assert!(range.contains(8));
        assert!(!range.contains(9));
        assert!(range.intersects(5, 20));
        assert!(!range.intersects(9, 20));
    }

    #[test]
    fn test_gap_len() {
        let gap = FinalizeGap::new(40, 55);
        assert_eq!(gap.len(), 15);
        assert_eq!(gap.key, "gap_40_55");
    }

    #[test]
    fn test_entry_to_find_key() {
        let entry = EntryToFind::new("chapter", "2");
        assert_eq!(entry.key, "chapter_2");
    }
}
