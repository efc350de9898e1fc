//! ToC finalize: pattern, discover, validate, then the closing re-sort
//!
//! The phase tag persists on the book document, so a crashed finalize
//! re-enters exactly the phase it left. The pattern result also persists,
//! which lets a recovered run skip the pattern call entirely.

use eyre::{Result, eyre};
use serde_json::json;
use tracing::{debug, info, warn};

use docstore::WriteOp;

use crate::agent::{
    AgentType, ToolContext, ToolLoopAgent, chapter_finder, chapter_finder::ChapterFindResult, gap_investigator,
    gap_investigator::GapFixResult,
};
use crate::domain::{
    BookOp, EntrySource, EntryToFind, FinalizeGap, FinalizePatternResult, FinalizePhase, FixType, TocEntry, UnitKind,
    WorkResult, WorkUnit, WorkUnitInfo,
};

use super::book::BookJob;
use super::{BOOKS, TOC_ENTRIES, persist_critical};

impl BookJob {
    /// Enter (or re-enter) the current finalize phase
    pub(crate) async fn enter_finalize_phase(&self) -> Result<Vec<WorkUnit>> {
        match self.state.finalize_phase() {
            FinalizePhase::NotStarted => {
                self.set_finalize_phase(FinalizePhase::Pattern).await?;
                self.enter_pattern().await
            }
            FinalizePhase::Pattern => self.enter_pattern().await,
            FinalizePhase::Discover => self.enter_discover().await,
            FinalizePhase::Validate => self.enter_validate().await,
            FinalizePhase::Done => {
                // Crash landed between the phase persist and the op
                // completion; just close out
                if !self.state.op(BookOp::TocFinalize).is_complete() {
                    self.finish_finalize().await?;
                }
                Ok(Vec::new())
            }
        }
    }

    /// Phase transitions are crash-recovery critical: sync persist, then
    /// memory
    async fn set_finalize_phase(&self, phase: FinalizePhase) -> Result<()> {
        persist_critical(
            &self.services.sink,
            WriteOp::update(
                BOOKS,
                self.state.book_doc_id(),
                json!({"finalize_phase": phase.to_string()}),
            ),
            "finalize phase",
        )
        .await?;
        self.state.set_finalize_phase(phase);
        debug!(book_id = %self.state.book_id(), %phase, "Finalize phase");
        Ok(())
    }

    // === Phase 1: pattern ===

    async fn enter_pattern(&self) -> Result<Vec<WorkUnit>> {
        // Recovery shortcut: a previous attempt already persisted the
        // pattern result
        if self.state.finalize_pattern().is_some() {
            debug!(book_id = %self.state.book_id(), "Reusing persisted finalize pattern");
            self.set_finalize_phase(FinalizePhase::Discover).await?;
            return self.enter_discover().await;
        }

        let linked = self.state.linked_entries();
        let entries_text = linked
            .iter()
            .map(|e| format!("{} -> {}", e.title, e.actual_page.unwrap_or(0)))
            .collect::<Vec<_>>()
            .join("\n");

        let (body_start, body_end) = self
            .state
            .body_range()
            .unwrap_or((1, self.state.total_pages()));

        let prompt = self.state.prompts().render(
            "finalize_pattern",
            &json!({
                "total_pages": self.state.total_pages(),
                "body_start": body_start,
                "body_end": body_end,
                "entries": entries_text,
            }),
        )?;

        let schema = json!({
            "type": "object",
            "properties": {
                "patterns": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "level_name": { "type": "string" },
                            "range_start": { "type": "integer" },
                            "range_end": { "type": "integer" }
                        },
                        "required": ["level_name", "range_start", "range_end"]
                    }
                },
                "excluded": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "start_page": { "type": "integer" },
                            "end_page": { "type": "integer" },
                            "reason": { "type": "string" }
                        },
                        "required": ["start_page", "end_page"]
                    }
                },
                "reasoning": { "type": "string" }
            },
            "required": ["patterns", "excluded"]
        });

        let request = crate::llm::ChatRequest::structured("", prompt, schema);
        let unit = crate::domain::WorkUnit::llm(
            self.job_id.clone(),
            self.state.providers().toc.clone(),
            request,
            self.metric("finalize_pattern", "book".to_string(), Some("finalize_pattern")),
        );
        self.register_unit(&unit, WorkUnitInfo::book(UnitKind::FinalizePattern));
        Ok(vec![unit])
    }

    pub(crate) async fn handle_finalize_pattern(&self, result: &WorkResult) -> Result<Vec<WorkUnit>> {
        let chat = result.chat().ok_or_else(|| eyre!("finalize pattern returned wrong outcome"))?;
        let parsed = chat
            .parsed_json
            .as_ref()
            .ok_or_else(|| eyre!("finalize pattern returned no structured result"))?;

        let pattern: FinalizePatternResult =
            serde_json::from_value(parsed.clone()).map_err(|e| eyre!("finalize pattern did not parse: {e}"))?;

        persist_critical(
            &self.services.sink,
            WriteOp::update(
                BOOKS,
                self.state.book_doc_id(),
                json!({"finalize_pattern_json": parsed}),
            ),
            "finalize pattern result",
        )
        .await?;
        self.state.set_finalize_pattern(pattern);

        self.set_finalize_phase(FinalizePhase::Discover).await?;
        self.enter_discover().await
    }

    // === Phase 2: discover ===

    async fn enter_discover(&self) -> Result<Vec<WorkUnit>> {
        let pattern = self
            .state
            .finalize_pattern()
            .ok_or_else(|| eyre!("discover phase without pattern result"))?;

        let to_find = entries_to_find(&pattern, &self.state.linked_entries());
        self.state.set_entries_to_find(to_find.clone());

        if to_find.is_empty() {
            debug!(book_id = %self.state.book_id(), "Nothing to discover");
            self.set_finalize_phase(FinalizePhase::Validate).await?;
            return self.enter_validate().await;
        }

        info!(book_id = %self.state.book_id(), missing = to_find.len(), "Discovering missing entries");

        let mut created = Vec::with_capacity(to_find.len());
        for entry in &to_find {
            let mut agent = chapter_finder::new_agent(&self.state, entry, self.budgets())?;
            if let Some(saved) = self.state.agent_state(AgentType::ChapterFinder, &entry.key)
                && !saved.complete
            {
                agent.restore_state(&saved);
            }
            created.push(agent);
        }

        for agent in &created {
            self.persist_agent_state(agent, false).await?;
        }
        self.services.sink.flush().await?;

        let mut units = Vec::new();
        let mut agents = self.agents.lock().await;
        for mut agent in created {
            let key = agent.instance_key().to_string();
            let info = WorkUnitInfo::book(UnitKind::FinalizeDiscover).with_finalize_key(key.clone());
            match self.agent_unit(
                &mut agent,
                info,
                "finalize_discover",
                format!("find:{key}"),
                "chapter_find_system",
            ) {
                Some(unit) => {
                    units.push(unit);
                    agents.insert((AgentType::ChapterFinder, key), agent);
                }
                None => {
                    warn!(key, "Chapter finder unusable at start, skipping");
                    self.mark_agent_state_complete(&agent).await;
                }
            }
        }
        drop(agents);

        if units.is_empty() {
            self.set_finalize_phase(FinalizePhase::Validate).await?;
            return self.enter_validate().await;
        }
        Ok(units)
    }

    pub(crate) async fn handle_discover(&self, info: &WorkUnitInfo, result: &WorkResult) -> Result<Vec<WorkUnit>> {
        let key = info
            .finalize_key
            .clone()
            .ok_or_else(|| eyre!("discover unit without key"))?;
        let chat = result.chat().ok_or_else(|| eyre!("discover unit returned wrong outcome"))?;

        let agent_key = (AgentType::ChapterFinder, key.clone());
        let mut agents = self.agents.lock().await;
        let Some(agent) = agents.get_mut(&agent_key) else {
            warn!(key, "No live chapter finder for result");
            return Ok(Vec::new());
        };

        let ctx = ToolContext::new(self.state.clone());
        agent.handle_llm_result(chat, &ctx).await;

        if !agent.is_done() {
            self.persist_agent_state(agent, false).await?;

            let next_info = WorkUnitInfo::book(UnitKind::FinalizeDiscover).with_finalize_key(key.clone());
            if let Some(unit) = self.agent_unit(
                agent,
                next_info,
                "finalize_discover",
                format!("find:{key}"),
                "chapter_find_system",
            ) {
                return Ok(vec![unit]);
            }
        }

        let agent = agents.remove(&agent_key).expect("agent present");
        drop(agents);
        self.finish_discover_entry(agent).await
    }

    async fn finish_discover_entry(&self, agent: ToolLoopAgent) -> Result<Vec<WorkUnit>> {
        let key = agent.instance_key().to_string();
        self.mark_agent_state_complete(&agent).await;

        if !agent.success() {
            return self.retry_discover_entry(&key).await;
        }

        let found = agent.result_json().map(ChapterFindResult::from_json).unwrap_or_default();

        if let (true, Some(page)) = (found.found, found.scan_page) {
            self.upsert_discovered_entry(&key, page, found.title).await?;
        } else {
            info!(key, "Expected chapter not found in scan");
        }

        self.after_discover_done().await
    }

    async fn upsert_discovered_entry(&self, key: &str, page: u32, title: Option<String>) -> Result<()> {
        let toc_doc_id = self
            .state
            .toc()
            .doc_id
            .ok_or_else(|| eyre!("discover without toc document"))?;
        let Some(page_doc_id) = self.state.page_doc_id(page) else {
            warn!(key, page, "Discovered page has no document");
            return Ok(());
        };

        let to_find = self.state.entries_to_find();
        let spec = to_find.iter().find(|e| e.key == key);
        let title = title.unwrap_or_else(|| match spec {
            Some(e) => format!("{} {}", capitalize(&e.level_name), e.identifier),
            None => key.to_string(),
        });

        let unique_key = format!("{toc_doc_id}:discovered:{key}");
        let body = json!({
            "book_id": self.state.book_id(),
            "toc_id": toc_doc_id,
            "unique_key": unique_key,
            "title": title,
            "level": 0,
            "identifier": spec.map(|e| e.identifier.clone()),
            "actual_page": page,
            "actual_page_id": page_doc_id,
            "sort_order": 0,
            "source": "discovered",
        });

        let receipt = persist_critical(
            &self.services.sink,
            WriteOp::upsert_doc(TOC_ENTRIES, unique_key.clone(), body),
            "discovered entry",
        )
        .await?;

        self.state.upsert_entry(TocEntry {
            doc_id: receipt.doc_id,
            unique_key,
            title,
            level: 0,
            identifier: spec.map(|e| e.identifier.clone()),
            printed_page: None,
            actual_page: Some(page),
            actual_page_id: Some(page_doc_id),
            sort_order: 0,
            source: EntrySource::Discovered,
        });

        info!(key, page, "Discovered missing entry");
        Ok(())
    }

    pub(crate) async fn retry_discover_entry(&self, key: &str) -> Result<Vec<WorkUnit>> {
        self.drop_agent(AgentType::ChapterFinder, key).await;

        let retries = self.bump_agent_retry(&format!("discover:{key}"));
        if retries > self.services.engine.max_finalize_retries {
            warn!(key, retries, "Chapter finder budget exhausted, proceeding without");
            return self.after_discover_done().await;
        }

        let Some(entry) = self.state.entries_to_find().into_iter().find(|e| e.key == key) else {
            return self.after_discover_done().await;
        };

        let mut agent = chapter_finder::new_agent(&self.state, &entry, self.budgets())?;
        self.persist_agent_state(&agent, false).await?;

        let info = WorkUnitInfo::book(UnitKind::FinalizeDiscover).with_finalize_key(key.to_string());
        match self.agent_unit(
            &mut agent,
            info,
            "finalize_discover",
            format!("find:{key}"),
            "chapter_find_system",
        ) {
            Some(unit) => {
                self.agents
                    .lock()
                    .await
                    .insert((AgentType::ChapterFinder, key.to_string()), agent);
                Ok(vec![unit])
            }
            None => self.after_discover_done().await,
        }
    }

    async fn after_discover_done(&self) -> Result<Vec<WorkUnit>> {
        let remaining = {
            let agents = self.agents.lock().await;
            agents
                .keys()
                .filter(|(agent_type, _)| *agent_type == AgentType::ChapterFinder)
                .count()
        };

        if remaining == 0 && self.state.finalize_phase() == FinalizePhase::Discover {
            self.set_finalize_phase(FinalizePhase::Validate).await?;
            return self.enter_validate().await;
        }
        Ok(Vec::new())
    }

    // === Phase 3: validate ===

    async fn enter_validate(&self) -> Result<Vec<WorkUnit>> {
        let gaps = compute_gaps(
            &self.state.linked_entries(),
            self.state.body_range(),
            self.state.total_pages(),
            self.state
                .finalize_pattern()
                .map(|p| p.excluded)
                .unwrap_or_default(),
            self.services.engine.min_gap_size,
        );
        self.state.set_gaps(gaps.clone());

        if gaps.is_empty() {
            debug!(book_id = %self.state.book_id(), "No gaps to investigate");
            self.finish_finalize().await?;
            return Ok(Vec::new());
        }

        info!(book_id = %self.state.book_id(), gaps = gaps.len(), "Investigating gaps");

        let mut created = Vec::with_capacity(gaps.len());
        for gap in &gaps {
            let mut agent = gap_investigator::new_agent(&self.state, gap, self.budgets())?;
            if let Some(saved) = self.state.agent_state(AgentType::GapInvestigator, &gap.key)
                && !saved.complete
            {
                agent.restore_state(&saved);
            }
            created.push(agent);
        }

        for agent in &created {
            self.persist_agent_state(agent, false).await?;
        }
        self.services.sink.flush().await?;

        let mut units = Vec::new();
        let mut agents = self.agents.lock().await;
        for mut agent in created {
            let key = agent.instance_key().to_string();
            let info = WorkUnitInfo::book(UnitKind::FinalizeValidate).with_finalize_key(key.clone());
            match self.agent_unit(
                &mut agent,
                info,
                "finalize_validate",
                format!("gap:{key}"),
                "gap_investigate_system",
            ) {
                Some(unit) => {
                    units.push(unit);
                    agents.insert((AgentType::GapInvestigator, key), agent);
                }
                None => {
                    warn!(key, "Gap investigator unusable at start, skipping");
                    self.mark_agent_state_complete(&agent).await;
                }
            }
        }
        drop(agents);

        if units.is_empty() {
            self.finish_finalize().await?;
        }
        Ok(units)
    }

    pub(crate) async fn handle_validate(&self, info: &WorkUnitInfo, result: &WorkResult) -> Result<Vec<WorkUnit>> {
        let key = info
            .finalize_key
            .clone()
            .ok_or_else(|| eyre!("validate unit without key"))?;
        let chat = result.chat().ok_or_else(|| eyre!("validate unit returned wrong outcome"))?;

        let agent_key = (AgentType::GapInvestigator, key.clone());
        let mut agents = self.agents.lock().await;
        let Some(agent) = agents.get_mut(&agent_key) else {
            warn!(key, "No live gap investigator for result");
            return Ok(Vec::new());
        };

        let ctx = ToolContext::new(self.state.clone());
        agent.handle_llm_result(chat, &ctx).await;

        if !agent.is_done() {
            self.persist_agent_state(agent, false).await?;

            let next_info = WorkUnitInfo::book(UnitKind::FinalizeValidate).with_finalize_key(key.clone());
            if let Some(unit) = self.agent_unit(
                agent,
                next_info,
                "finalize_validate",
                format!("gap:{key}"),
                "gap_investigate_system",
            ) {
                return Ok(vec![unit]);
            }
        }

        let agent = agents.remove(&agent_key).expect("agent present");
        drop(agents);
        self.finish_gap(agent).await
    }

    async fn finish_gap(&self, agent: ToolLoopAgent) -> Result<Vec<WorkUnit>> {
        let key = agent.instance_key().to_string();
        self.mark_agent_state_complete(&agent).await;

        if !agent.success() {
            return self.retry_gap(&key).await;
        }

        if let Some(parsed) = agent.result_json() {
            let fix = GapFixResult::from_json(parsed);
            self.apply_gap_fix(&key, fix).await?;
        }

        self.after_validate_done().await
    }

    async fn apply_gap_fix(&self, gap_key: &str, fix: GapFixResult) -> Result<()> {
        match fix.fix_type {
            FixType::AddEntry => {
                let toc_doc_id = self
                    .state
                    .toc()
                    .doc_id
                    .ok_or_else(|| eyre!("validate without toc document"))?;
                let Some(page) = fix.scan_page else { return Ok(()) };
                let Some(page_doc_id) = self.state.page_doc_id(page) else {
                    warn!(gap_key, page, "Fix page has no document");
                    return Ok(());
                };

                let title = fix.title.unwrap_or_else(|| "Untitled section".to_string());
                let unique_key = format!("{toc_doc_id}:validated:{gap_key}");
                let body = json!({
                    "book_id": self.state.book_id(),
                    "toc_id": toc_doc_id,
                    "unique_key": unique_key,
                    "title": title,
                    "level": 0,
                    "actual_page": page,
                    "actual_page_id": page_doc_id,
                    "sort_order": 0,
                    "source": "validated",
                });

                let receipt = persist_critical(
                    &self.services.sink,
                    WriteOp::upsert_doc(TOC_ENTRIES, unique_key.clone(), body),
                    "validated entry",
                )
                .await?;

                self.state.upsert_entry(TocEntry {
                    doc_id: receipt.doc_id,
                    unique_key,
                    title,
                    level: 0,
                    identifier: None,
                    printed_page: None,
                    actual_page: Some(page),
                    actual_page_id: Some(page_doc_id),
                    sort_order: 0,
                    source: EntrySource::Validated,
                });
                info!(gap_key, page, "Gap fix: added entry");
            }

            FixType::CorrectEntry => {
                let Some(page) = fix.scan_page else { return Ok(()) };
                let Some(entry_title) = fix.entry_title else {
                    warn!(gap_key, "correct_entry without entry title");
                    return Ok(());
                };
                let needle = entry_title.to_lowercase();
                let Some(entry) = self
                    .state
                    .entries()
                    .into_iter()
                    .find(|e| e.title.to_lowercase().contains(&needle))
                else {
                    warn!(gap_key, entry_title, "No entry matches correction target");
                    return Ok(());
                };
                let Some(page_doc_id) = self.state.page_doc_id(page) else {
                    warn!(gap_key, page, "Correction page has no document");
                    return Ok(());
                };

                persist_critical(
                    &self.services.sink,
                    WriteOp::update(
                        TOC_ENTRIES,
                        &entry.doc_id,
                        json!({"actual_page": page, "actual_page_id": page_doc_id}),
                    ),
                    "entry correction",
                )
                .await?;

                self.state.update_entry(&entry.doc_id, |e| {
                    e.actual_page = Some(page);
                    e.actual_page_id = Some(page_doc_id.clone());
                });
                info!(gap_key, entry = %entry.doc_id, page, "Gap fix: corrected entry");
            }

            FixType::FlagForReview => {
                warn!(
                    gap_key,
                    reasoning = fix.reasoning.as_deref().unwrap_or(""),
                    "Gap flagged for review"
                );
            }

            FixType::NoFixNeeded => {
                debug!(gap_key, "Gap needs no fix");
            }
        }
        Ok(())
    }

    pub(crate) async fn retry_gap(&self, key: &str) -> Result<Vec<WorkUnit>> {
        self.drop_agent(AgentType::GapInvestigator, key).await;

        let retries = self.bump_agent_retry(&format!("gap:{key}"));
        if retries > self.services.engine.max_finalize_retries {
            warn!(key, retries, "Gap investigator budget exhausted, proceeding");
            return self.after_validate_done().await;
        }

        let Some(gap) = self.state.gaps().into_iter().find(|g| g.key == key) else {
            return self.after_validate_done().await;
        };

        let mut agent = gap_investigator::new_agent(&self.state, &gap, self.budgets())?;
        self.persist_agent_state(&agent, false).await?;

        let info = WorkUnitInfo::book(UnitKind::FinalizeValidate).with_finalize_key(key.to_string());
        match self.agent_unit(
            &mut agent,
            info,
            "finalize_validate",
            format!("gap:{key}"),
            "gap_investigate_system",
        ) {
            Some(unit) => {
                self.agents
                    .lock()
                    .await
                    .insert((AgentType::GapInvestigator, key.to_string()), agent);
                Ok(vec![unit])
            }
            None => self.after_validate_done().await,
        }
    }

    async fn after_validate_done(&self) -> Result<Vec<WorkUnit>> {
        let remaining = {
            let agents = self.agents.lock().await;
            agents
                .keys()
                .filter(|(agent_type, _)| *agent_type == AgentType::GapInvestigator)
                .count()
        };

        if remaining == 0 && self.state.finalize_phase() == FinalizePhase::Validate {
            self.finish_finalize().await?;
        }
        Ok(Vec::new())
    }

    // === Completion ===

    /// Close the ToC: flush, reload, re-sort by actual page, persist the
    /// fresh sort order, and only then complete the op. Structure depends
    /// on the final order, so everything here is synchronous.
    async fn finish_finalize(&self) -> Result<()> {
        self.services.sink.flush().await?;

        if let Some(toc_doc_id) = self.state.toc().doc_id {
            self.reload_entries(&toc_doc_id)?;
        }

        let mut entries = self.state.entries();
        entries.sort_by(|a, b| match (a.actual_page, b.actual_page) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.sort_order.cmp(&b.sort_order),
        });

        for (index, entry) in entries.iter_mut().enumerate() {
            entry.sort_order = (index as i64 + 1) * 100;
            if !entry.doc_id.is_empty() {
                self.services
                    .sink
                    .send_sync(WriteOp::update(
                        TOC_ENTRIES,
                        &entry.doc_id,
                        json!({"sort_order": entry.sort_order}),
                    ))
                    .await?;
            }
        }
        self.state.set_entries(entries);

        self.set_finalize_phase(FinalizePhase::Done).await?;
        self.complete_book_op(BookOp::TocFinalize, json!({})).await?;
        info!(book_id = %self.state.book_id(), "ToC finalized");
        Ok(())
    }
}

/// Expand each pattern's identifier range, dropping identifiers already
/// present among the linked entries
fn entries_to_find(pattern: &FinalizePatternResult, linked: &[TocEntry]) -> Vec<EntryToFind> {
    let mut out = Vec::new();

    for discovered in &pattern.patterns {
        for identifier in discovered.identifiers() {
            let level = discovered.level_name.to_lowercase();
            let needle = format!("{level} {identifier}");

            let exists = linked.iter().any(|entry| {
                if entry.identifier.as_deref() == Some(identifier.as_str()) {
                    return true;
                }
                let title = entry.title.to_lowercase();
                // "chapter 2" must not match "chapter 20"
                title
                    .find(&needle)
                    .is_some_and(|pos| match title[pos + needle.len()..].chars().next() {
                        Some(c) => !c.is_ascii_digit(),
                        None => true,
                    })
            });

            if !exists {
                out.push(EntryToFind::new(&discovered.level_name, &identifier));
            }
        }
    }

    out
}

/// Gaps between consecutive linked entries (and the body boundaries)
/// longer than the threshold, skipping spans that touch excluded ranges
fn compute_gaps(
    linked: &[TocEntry],
    body_range: Option<(u32, u32)>,
    total_pages: u32,
    excluded: Vec<crate::domain::ExcludedRange>,
    min_gap_size: u32,
) -> Vec<FinalizeGap> {
    let mut points: Vec<u32> = linked.iter().filter_map(|e| e.actual_page).collect();
    points.sort_unstable();
    points.dedup();

    let (body_start, body_end) = body_range.unwrap_or((1, total_pages));
    if points.first().is_none_or(|&first| first > body_start) {
        points.insert(0, body_start);
    }
    if points.last().is_none_or(|&last| last < body_end) {
        points.push(body_end);
    }

    let mut gaps = Vec::new();
    for pair in points.windows(2) {
        let (start, end) = (pair[0], pair[1]);
        if end - start <= min_gap_size {
            continue;
        }
        if excluded.iter().any(|range| range.intersects(start, end)) {
            continue;
        }
        gaps.push(FinalizeGap::new(start, end));
    }

    gaps
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DiscoveredPattern, ExcludedRange};

    fn linked(title: &str, identifier: Option<&str>, page: u32) -> TocEntry {
        TocEntry {
            doc_id: format!("e-{page}"),
            title: title.to_string(),
            identifier: identifier.map(String::from),
            actual_page: Some(page),
            actual_page_id: Some(format!("p-{page}")),
            ..Default::default()
        }
    }

    fn chapter_pattern(start: u32, end: u32) -> FinalizePatternResult {
        FinalizePatternResult {
            patterns: vec![DiscoveredPattern {
                level_name: "chapter".to_string(),
                range_start: start,
                range_end: end,
            }],
            excluded: Vec::new(),
            reasoning: String::new(),
        }
    }

    #[test]
    fn test_entries_to_find_drops_existing() {
        // chapters 1 and 3 linked, pattern says 1..3
        let existing = vec![
            linked("Chapter 1", Some("1"), 10),
            linked("Chapter 3", Some("3"), 50),
        ];
        let to_find = entries_to_find(&chapter_pattern(1, 3), &existing);

        assert_eq!(to_find.len(), 1);
        assert_eq!(to_find[0].key, "chapter_2");
        assert_eq!(to_find[0].identifier, "2");
    }

    #[test]
    fn test_entries_to_find_matches_by_title() {
        let existing = vec![linked("Chapter 2: The Long Road", None, 30)];
        let to_find = entries_to_find(&chapter_pattern(1, 2), &existing);

        // Chapter 2 matched by title; chapter 1 still missing
        assert_eq!(to_find.len(), 1);
        assert_eq!(to_find[0].key, "chapter_1");
    }

    #[test]
    fn test_title_match_does_not_conflate_prefixes() {
        let existing = vec![linked("Chapter 20", None, 300)];
        let to_find = entries_to_find(&chapter_pattern(2, 2), &existing);

        // "chapter 2" must not be satisfied by "Chapter 20"
        assert_eq!(to_find.len(), 1);
        assert_eq!(to_find[0].key, "chapter_2");
    }

    #[test]
    fn test_compute_gaps_thresholds() {
        let entries = vec![
            linked("Chapter 1", Some("1"), 10),
            linked("Chapter 2", Some("2"), 18),
            linked("Chapter 3", Some("3"), 50),
        ];
        let gaps = compute_gaps(&entries, Some((10, 90)), 100, Vec::new(), 10);

        // 10->18 too small; 18->50 and 50->90 qualify
        assert_eq!(gaps.len(), 2);
        assert_eq!((gaps[0].start_page, gaps[0].end_page), (18, 50));
        assert_eq!((gaps[1].start_page, gaps[1].end_page), (50, 90));
    }

    #[test]
    fn test_compute_gaps_skips_excluded() {
        let entries = vec![
            linked("Chapter 1", Some("1"), 10),
            linked("Chapter 2", Some("2"), 50),
        ];
        let excluded = vec![ExcludedRange {
            start_page: 30,
            end_page: 40,
            reason: "plates".to_string(),
        }];
        let gaps = compute_gaps(&entries, Some((10, 50)), 100, excluded, 10);
        assert!(gaps.is_empty());
    }

    #[test]
    fn test_compute_gaps_uses_body_boundaries() {
        let entries = vec![linked("Chapter 1", Some("1"), 40)];
        let gaps = compute_gaps(&entries, Some((10, 90)), 100, Vec::new(), 10);

        // body_start -> first entry, and first entry -> body_end
        assert_eq!(gaps.len(), 2);
        assert_eq!((gaps[0].start_page, gaps[0].end_page), (10, 40));
        assert_eq!((gaps[1].start_page, gaps[1].end_page), (40, 90));
    }
}
