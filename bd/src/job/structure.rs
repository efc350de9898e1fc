//! Structure: build chapters from the finalized ToC, merge their text,
//! classify them, and polish the audio-bound ones
//!
//! Chapter upserts key on `{book_id}:{toc_entry_id}` so doc ids survive
//! re-runs. Polish failures degrade to the mechanical text instead of
//! blocking completion.

use eyre::{Result, eyre};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use docstore::WriteOp;

use crate::domain::{
    BookOp, BookState, ChapterState, CpuOutcome, CpuTask, MatterType, PageTextInput, TocEntry, UnitKind, WorkResult,
    WorkUnit, WorkUnitInfo,
};

use super::book::BookJob;
use super::units::clamp;
use super::{CHAPTERS, persist_critical};

impl BookJob {
    /// Entry point from the gated start and the crash sweep: build the
    /// skeleton if it does not exist yet, then emit whatever the next
    /// stage needs
    pub(crate) async fn advance_structure(&self) -> Result<Vec<WorkUnit>> {
        if self.state.chapters().is_empty() {
            let mut chapters = build_chapters(self.state.book_id(), &self.state.entries(), self.state.total_pages());

            if chapters.is_empty() {
                info!(book_id = %self.state.book_id(), "No linked entries, structure is empty");
                return self.finalize_structure().await;
            }

            for chapter in &mut chapters {
                let receipt = self
                    .services
                    .sink
                    .send_sync(WriteOp::upsert_doc(
                        CHAPTERS,
                        chapter.unique_key.clone(),
                        chapter.to_body(self.state.book_id()),
                    ))
                    .await?;
                chapter.doc_id = Some(receipt.doc_id);
            }

            info!(book_id = %self.state.book_id(), chapters = chapters.len(), "Chapter skeleton built");
            self.state.set_chapters(chapters);
        }

        self.next_structure_units().await
    }

    /// What does the current chapter state still need?
    async fn next_structure_units(&self) -> Result<Vec<WorkUnit>> {
        let chapters = self.state.chapters();

        let pending_merge: Vec<&ChapterState> = chapters.iter().filter(|c| c.mechanical_text.is_none()).collect();
        if !pending_merge.is_empty() {
            return pending_merge.into_iter().map(|c| self.merge_unit(c)).collect();
        }

        if chapters.iter().any(|c| c.matter_type.is_none()) {
            return Ok(vec![self.classify_unit(&chapters)?]);
        }

        let pending_polish: Vec<&ChapterState> = chapters.iter().filter(|c| polish_pending(c)).collect();
        if !pending_polish.is_empty() {
            return pending_polish.into_iter().map(|c| self.polish_unit(c)).collect();
        }

        self.finalize_structure().await
    }

    fn merge_unit(&self, chapter: &ChapterState) -> Result<WorkUnit> {
        let pages = chapter_page_inputs(&self.state, chapter.start_page, chapter.end_page);
        let task = CpuTask::MergeChapterText {
            chapter_key: chapter.unique_key.clone(),
            pages,
        };

        let unit = WorkUnit::cpu(
            self.job_id.clone(),
            task,
            self.metric("structure_merge", format!("chapter:{}", chapter.unique_key), None),
        );
        self.register_unit(
            &unit,
            WorkUnitInfo::book(UnitKind::StructureMerge).with_chapter(chapter.unique_key.clone()),
        );
        Ok(unit)
    }

    fn classify_unit(&self, chapters: &[ChapterState]) -> Result<WorkUnit> {
        let summaries: Vec<Value> = chapters
            .iter()
            .map(|c| {
                json!({
                    "key": c.unique_key,
                    "title": c.title,
                    "start_page": c.start_page,
                    "end_page": c.end_page,
                    "word_count": c.word_count,
                    "excerpt": clamp(c.mechanical_text.as_deref().unwrap_or(""), 400),
                })
            })
            .collect();

        let prompt = self
            .state
            .prompts()
            .render("chapter_classify", &json!({"chapters": summaries}))?;

        let schema = json!({
            "type": "object",
            "properties": {
                "chapters": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "key": { "type": "string" },
                            "matter_type": { "type": "string", "enum": ["front", "body", "back"] },
                            "content_type": { "type": "string" },
                            "audio_include": { "type": "boolean" }
                        },
                        "required": ["key", "matter_type", "content_type", "audio_include"]
                    }
                }
            },
            "required": ["chapters"]
        });

        let request = crate::llm::ChatRequest::structured("", prompt, schema);
        let unit = WorkUnit::llm(
            self.job_id.clone(),
            self.state.providers().metadata.clone(),
            request,
            self.metric("structure_classify", "book".to_string(), Some("chapter_classify")),
        );
        self.register_unit(&unit, WorkUnitInfo::book(UnitKind::StructureClassify));
        Ok(unit)
    }

    fn polish_unit(&self, chapter: &ChapterState) -> Result<WorkUnit> {
        let text = chapter
            .mechanical_text
            .clone()
            .ok_or_else(|| eyre!("polish before merge for {}", chapter.unique_key))?;

        let prompt = self
            .state
            .prompts()
            .render("chapter_polish", &json!({"title": chapter.title, "text": text}))?;

        let schema = json!({
            "type": "object",
            "properties": {
                "edits": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "op": { "type": "string", "enum": ["replace", "delete"] },
                            "find": { "type": "string" },
                            "replace": { "type": "string" }
                        },
                        "required": ["op", "find"]
                    }
                }
            },
            "required": ["edits"]
        });

        let request = crate::llm::ChatRequest::structured("", prompt, schema);
        let unit = WorkUnit::llm(
            self.job_id.clone(),
            self.state.providers().metadata.clone(),
            request,
            self.metric(
                "structure_polish",
                format!("chapter:{}", chapter.unique_key),
                Some("chapter_polish"),
            ),
        );
        self.register_unit(
            &unit,
            WorkUnitInfo::book(UnitKind::StructurePolish).with_chapter(chapter.unique_key.clone()),
        );
        Ok(unit)
    }

    // === Handlers ===

    pub(crate) async fn handle_structure_merge(&self, _info: &WorkUnitInfo, result: &WorkResult) -> Result<Vec<WorkUnit>> {
        let Some(CpuOutcome::ChapterMerged {
            chapter_key,
            text,
            word_count,
        }) = result.cpu()
        else {
            return Err(eyre!("merge unit returned wrong outcome"));
        };

        let doc_id = self.chapter_doc_id(chapter_key)?;
        self.services
            .sink
            .send_sync(WriteOp::update(
                CHAPTERS,
                &doc_id,
                json!({"mechanical_text": text, "word_count": word_count}),
            ))
            .await?;

        self.state.update_chapter(chapter_key, |c| {
            c.mechanical_text = Some(text.clone());
            c.word_count = *word_count;
        });
        debug!(book_id = %self.state.book_id(), chapter = %chapter_key, words = word_count, "Chapter merged");

        // The last merge moves the stage forward
        if self.state.chapters().iter().all(|c| c.mechanical_text.is_some()) {
            let chapters = self.state.chapters();
            return Ok(vec![self.classify_unit(&chapters)?]);
        }
        Ok(Vec::new())
    }

    pub(crate) async fn handle_structure_classify(&self, result: &WorkResult) -> Result<Vec<WorkUnit>> {
        let chat = result.chat().ok_or_else(|| eyre!("classify unit returned wrong outcome"))?;
        let parsed = chat
            .parsed_json
            .as_ref()
            .ok_or_else(|| eyre!("classify returned no structured result"))?;
        let classified = parsed["chapters"]
            .as_array()
            .ok_or_else(|| eyre!("classify result missing chapters"))?;

        for item in classified {
            let Some(key) = item["key"].as_str() else { continue };
            let matter_type: Option<MatterType> = serde_json::from_value(item["matter_type"].clone()).ok();
            let content_type = item["content_type"].as_str().map(String::from);
            let audio_include = item["audio_include"].as_bool().unwrap_or(false);

            self.apply_classification(key, matter_type, content_type, audio_include)
                .await?;
        }

        // Anything the classifier skipped defaults to an audio body chapter
        let unclassified: Vec<String> = self
            .state
            .chapters()
            .iter()
            .filter(|c| c.matter_type.is_none())
            .map(|c| c.unique_key.clone())
            .collect();
        for key in unclassified {
            warn!(chapter = %key, "Classifier skipped chapter, defaulting to body");
            self.apply_classification(&key, Some(MatterType::Body), Some("chapter".to_string()), true)
                .await?;
        }

        info!(book_id = %self.state.book_id(), chapters = classified.len(), "Chapters classified");
        self.next_structure_units().await
    }

    async fn apply_classification(
        &self,
        key: &str,
        matter_type: Option<MatterType>,
        content_type: Option<String>,
        audio_include: bool,
    ) -> Result<()> {
        let matter_type = matter_type.unwrap_or(MatterType::Body);
        let doc_id = self.chapter_doc_id(key)?;

        // Chapters outside the audio cut keep their mechanical text as the
        // final text
        let copied_text = if audio_include {
            None
        } else {
            self.state
                .chapters()
                .iter()
                .find(|c| c.unique_key == key)
                .and_then(|c| c.mechanical_text.clone())
        };

        self.services
            .sink
            .send_sync(WriteOp::update(
                CHAPTERS,
                &doc_id,
                json!({
                    "matter_type": matter_type,
                    "content_type": content_type,
                    "audio_include": audio_include,
                    "polished_text": copied_text,
                }),
            ))
            .await?;

        self.state.update_chapter(key, |c| {
            c.matter_type = Some(matter_type);
            c.content_type = content_type.clone();
            c.audio_include = audio_include;
            if let Some(text) = &copied_text {
                c.polished_text = Some(text.clone());
            }
        });
        Ok(())
    }

    pub(crate) async fn handle_structure_polish(&self, info: &WorkUnitInfo, result: &WorkResult) -> Result<Vec<WorkUnit>> {
        let chapter_key = info
            .chapter_key
            .clone()
            .ok_or_else(|| eyre!("polish unit without chapter"))?;
        let chat = result.chat().ok_or_else(|| eyre!("polish unit returned wrong outcome"))?;
        let parsed = chat
            .parsed_json
            .as_ref()
            .ok_or_else(|| eyre!("polish returned no structured result"))?;

        let mechanical = self
            .state
            .chapters()
            .iter()
            .find(|c| c.unique_key == chapter_key)
            .and_then(|c| c.mechanical_text.clone())
            .ok_or_else(|| eyre!("polish for unmerged chapter {chapter_key}"))?;

        let polished = apply_edits(&mechanical, &parsed["edits"]);

        let doc_id = self.chapter_doc_id(&chapter_key)?;
        self.services
            .sink
            .send_sync(WriteOp::update(
                CHAPTERS,
                &doc_id,
                json!({"polished_text": polished, "polish_failed": false}),
            ))
            .await?;

        self.state.update_chapter(&chapter_key, |c| {
            c.polished_text = Some(polished.clone());
            c.polish_failed = false;
        });
        debug!(book_id = %self.state.book_id(), chapter = %chapter_key, "Chapter polished");

        self.finish_structure_if_polished().await
    }

    /// Polish failure path: retry within budget, then fall back to the
    /// mechanical text
    pub(crate) async fn retry_polish(&self, info: &WorkUnitInfo) -> Result<Vec<WorkUnit>> {
        let chapter_key = info
            .chapter_key
            .clone()
            .ok_or_else(|| eyre!("polish unit without chapter"))?;

        if info.retry_count < self.services.engine.max_finalize_retries {
            let chapters = self.state.chapters();
            let Some(chapter) = chapters.iter().find(|c| c.unique_key == chapter_key) else {
                return Ok(Vec::new());
            };
            debug!(chapter = %chapter_key, attempt = info.retry_count + 1, "Retrying polish");
            let unit = self.polish_unit(chapter)?;
            // Carry the retry count onto the fresh registration
            self.units
                .lock()
                .expect("units lock poisoned")
                .insert(unit.id, info.retry());
            return Ok(vec![unit]);
        }

        warn!(chapter = %chapter_key, "Polish budget exhausted, falling back to mechanical text");

        let mechanical = self
            .state
            .chapters()
            .iter()
            .find(|c| c.unique_key == chapter_key)
            .and_then(|c| c.mechanical_text.clone())
            .unwrap_or_default();

        let doc_id = self.chapter_doc_id(&chapter_key)?;
        self.services
            .sink
            .send_sync(WriteOp::update(
                CHAPTERS,
                &doc_id,
                json!({"polished_text": mechanical, "polish_failed": true}),
            ))
            .await?;

        self.state.update_chapter(&chapter_key, |c| {
            c.polished_text = Some(mechanical.clone());
            c.polish_failed = true;
        });

        self.finish_structure_if_polished().await
    }

    async fn finish_structure_if_polished(&self) -> Result<Vec<WorkUnit>> {
        if self.state.chapters().iter().any(polish_pending) {
            return Ok(Vec::new());
        }
        self.finalize_structure().await
    }

    /// Mark the book structured; the final structure persist is
    /// completion-critical
    pub(crate) async fn finalize_structure(&self) -> Result<Vec<WorkUnit>> {
        persist_critical(
            &self.services.sink,
            WriteOp::update(
                super::BOOKS,
                self.state.book_doc_id(),
                json!({"structure_complete": true}),
            ),
            "structure completion",
        )
        .await?;
        self.complete_book_op(BookOp::Structure, json!({})).await?;
        info!(book_id = %self.state.book_id(), "Structure complete");
        Ok(Vec::new())
    }

    fn chapter_doc_id(&self, unique_key: &str) -> Result<String> {
        self.state
            .chapters()
            .iter()
            .find(|c| c.unique_key == unique_key)
            .and_then(|c| c.doc_id.clone())
            .ok_or_else(|| eyre!("chapter {unique_key} has no document"))
    }
}

fn polish_pending(chapter: &ChapterState) -> bool {
    chapter.audio_include && chapter.polished_text.is_none() && !chapter.polish_failed
}

/// Build the chapter skeleton from linked entries sorted by sort order
///
/// Each chapter runs from its entry's page to the page before the next
/// entry; the last chapter ends at the book's last page. Parents resolve
/// to indices by walking levels.
pub fn build_chapters(book_id: &str, entries: &[TocEntry], total_pages: u32) -> Vec<ChapterState> {
    let mut linked: Vec<&TocEntry> = entries.iter().filter(|e| e.actual_page.is_some()).collect();
    linked.sort_by_key(|e| e.sort_order);

    let mut chapters = Vec::with_capacity(linked.len());
    // (level, index) stack for parent resolution
    let mut stack: Vec<(u32, usize)> = Vec::new();

    for (index, entry) in linked.iter().enumerate() {
        let start_page = entry.actual_page.expect("filtered on actual_page");
        let end_page = match linked.get(index + 1).and_then(|next| next.actual_page) {
            Some(next_start) => next_start.saturating_sub(1).max(start_page),
            None => total_pages,
        };

        while stack.last().is_some_and(|(level, _)| *level >= entry.level) {
            stack.pop();
        }
        let parent_index = stack.last().map(|(_, parent)| *parent);
        stack.push((entry.level, index));

        let unique_key = if entry.doc_id.is_empty() {
            ChapterState::orphan_key(book_id, entry.sort_order)
        } else {
            ChapterState::entry_key(book_id, &entry.doc_id)
        };

        chapters.push(ChapterState {
            doc_id: None,
            unique_key,
            title: entry.title.clone(),
            level: entry.level,
            start_page,
            end_page,
            parent_index,
            toc_entry_id: (!entry.doc_id.is_empty()).then(|| entry.doc_id.clone()),
            sort_order: entry.sort_order,
            ..Default::default()
        });
    }

    chapters
}

/// Collect a chapter's pages with the header/footer detected per page
fn chapter_page_inputs(state: &BookState, start_page: u32, end_page: u32) -> Vec<PageTextInput> {
    (start_page..=end_page)
        .filter_map(|page| {
            let record = state.page(page)?;
            let text = record.blended_text.clone()?;
            let (header, footer) = match &record.label {
                Some(label) => (label.header.clone(), label.footer.clone()),
                None => (None, None),
            };
            Some(PageTextInput {
                page,
                text,
                header,
                footer,
            })
        })
        .collect()
}

/// Merge page texts into one chapter body, stripping the running header
/// and footer lines each page carries
pub fn merge_chapter_text(pages: &[PageTextInput]) -> (String, u32) {
    let mut parts = Vec::with_capacity(pages.len());

    for page in pages {
        let mut lines: Vec<&str> = page.text.lines().collect();

        if let Some(header) = &page.header {
            if let Some(first) = lines.iter().position(|l| !l.trim().is_empty())
                && lines[first].trim().eq_ignore_ascii_case(header.trim())
            {
                lines.remove(first);
            }
        }
        if let Some(footer) = &page.footer {
            if let Some(last) = lines.iter().rposition(|l| !l.trim().is_empty())
                && lines[last].trim().eq_ignore_ascii_case(footer.trim())
            {
                lines.remove(last);
            }
        }

        let cleaned = lines.join("\n");
        let trimmed = cleaned.trim();
        if !trimmed.is_empty() {
            parts.push(trimmed.to_string());
        }
    }

    let text = parts.join("\n\n");
    let word_count = text.split_whitespace().count() as u32;
    (text, word_count)
}

/// Apply polish edit operations; each hits the first occurrence only
pub fn apply_edits(text: &str, edits: &Value) -> String {
    let Some(edits) = edits.as_array() else {
        return text.to_string();
    };

    let mut out = text.to_string();
    for edit in edits {
        let Some(find) = edit["find"].as_str() else { continue };
        if find.is_empty() {
            continue;
        }

        match edit["op"].as_str() {
            Some("replace") => {
                let replace = edit["replace"].as_str().unwrap_or("");
                out = out.replacen(find, replace, 1);
            }
            Some("delete") => {
                out = out.replacen(find, "", 1);
            }
            other => debug!(?other, "Ignoring unknown edit op"),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(doc_id: &str, title: &str, level: u32, page: u32, sort_order: i64) -> TocEntry {
        TocEntry {
            doc_id: doc_id.to_string(),
            title: title.to_string(),
            level,
            actual_page: Some(page),
            actual_page_id: Some(format!("p-{page}")),
            sort_order,
            ..Default::default()
        }
    }

    #[test]
    fn test_build_chapters_page_ranges() {
        let entries = vec![
            entry("e1", "Chapter 1", 0, 10, 100),
            entry("e2", "Chapter 2", 0, 30, 200),
            entry("e3", "Chapter 3", 0, 50, 300),
        ];
        let chapters = build_chapters("b1", &entries, 80);

        assert_eq!(chapters.len(), 3);
        assert_eq!((chapters[0].start_page, chapters[0].end_page), (10, 29));
        assert_eq!((chapters[1].start_page, chapters[1].end_page), (30, 49));
        assert_eq!((chapters[2].start_page, chapters[2].end_page), (50, 80));
        assert_eq!(chapters[0].unique_key, "b1:e1");
    }

    #[test]
    fn test_build_chapters_parent_resolution() {
        let entries = vec![
            entry("e1", "Part I", 0, 10, 100),
            entry("e2", "Chapter 1", 1, 12, 200),
            entry("e3", "Chapter 2", 1, 30, 300),
            entry("e4", "Part II", 0, 50, 400),
            entry("e5", "Chapter 3", 1, 52, 500),
        ];
        let chapters = build_chapters("b1", &entries, 90);

        assert_eq!(chapters[0].parent_index, None);
        assert_eq!(chapters[1].parent_index, Some(0));
        assert_eq!(chapters[2].parent_index, Some(0));
        assert_eq!(chapters[3].parent_index, None);
        assert_eq!(chapters[4].parent_index, Some(3));
    }

    #[test]
    fn test_build_chapters_skips_unlinked() {
        let mut unlinked = entry("e2", "Lost Chapter", 0, 0, 200);
        unlinked.actual_page = None;
        let entries = vec![entry("e1", "Chapter 1", 0, 10, 100), unlinked];

        let chapters = build_chapters("b1", &entries, 50);
        assert_eq!(chapters.len(), 1);
        assert_eq!(chapters[0].end_page, 50);
    }

    #[test]
    fn test_merge_strips_header_and_footer() {
        let pages = vec![
            PageTextInput {
                page: 10,
                text: "MOBY DICK\nCall me Ishmael. Some years ago\n42".to_string(),
                header: Some("MOBY DICK".to_string()),
                footer: Some("42".to_string()),
            },
            PageTextInput {
                page: 11,
                text: "MOBY DICK\nnever mind how long precisely\n43".to_string(),
                header: Some("MOBY DICK".to_string()),
                footer: Some("43".to_string()),
            },
        ];

        let (text, words) = merge_chapter_text(&pages);
        assert_eq!(
            text,
            "Call me Ishmael. Some years ago\n\nnever mind how long precisely"
        );
        assert_eq!(words, 11);
    }

    #[test]
    fn test_merge_keeps_unmatched_furniture() {
        let pages = vec![PageTextInput {
            page: 10,
            text: "A different heading\nbody text".to_string(),
            header: Some("MOBY DICK".to_string()),
            footer: None,
        }];

        let (text, _) = merge_chapter_text(&pages);
        assert_eq!(text, "A different heading\nbody text");
    }

    #[test]
    fn test_apply_edits() {
        let text = "The qu-\nick brown fox. The qu-\nick dog.";
        let edits = serde_json::json!([
            {"op": "replace", "find": "qu-\nick", "replace": "quick"},
            {"op": "delete", "find": " dog"},
        ]);

        let out = apply_edits(text, &edits);
        // replace hits only the first occurrence
        assert_eq!(out, "The quick brown fox. The qu-\nick.");
    }

    #[test]
    fn test_apply_edits_tolerates_garbage() {
        let text = "unchanged";
        assert_eq!(apply_edits(text, &serde_json::json!(null)), "unchanged");
        assert_eq!(
            apply_edits(text, &serde_json::json!([{"op": "explode", "find": "x"}])),
            "unchanged"
        );
        assert_eq!(apply_edits(text, &serde_json::json!([{"op": "delete", "find": ""}])), "unchanged");
    }
}
