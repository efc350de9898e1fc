//! Book-operation completion handlers: metadata, toc_finder, toc_extract,
//! pattern_analysis, toc_link
//!
//! Operation completions follow the persist discipline: the sync write
//! commits first, only then does the in-memory state flip.

use eyre::{Result, eyre};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use docstore::{Filter, WriteOp};

use crate::agent::{
    AgentType, ToolContext, ToolLoopAgent, entry_finder, entry_finder::EntryFindResult, toc_finder,
    toc_finder::TocFinderResult,
};
use crate::domain::{
    BookMetadata, BookOp, PatternAnalysisResult, PatternSubtype, TocEntry, TocInfo, UnitKind, WorkResult, WorkUnit,
    WorkUnitInfo,
};

use super::book::BookJob;
use super::{AGENT_STATES, BOOKS, TOCS, TOC_ENTRIES, persist_critical};

impl BookJob {
    /// Complete a book op: sync persist of its fields (plus any payload
    /// fields), then flip memory
    pub(crate) async fn complete_book_op(&self, op: BookOp, extra: Value) -> Result<()> {
        let mut copy = self.state.op(op);
        copy.complete();

        let mut fields = copy.to_fields(op.name());
        if let (Some(fields_map), Value::Object(extra_map)) = (fields.as_object_mut(), extra) {
            for (key, value) in extra_map {
                fields_map.insert(key, value);
            }
        }

        persist_critical(
            &self.services.sink,
            WriteOp::update(BOOKS, self.state.book_doc_id(), fields),
            op.name(),
        )
        .await?;

        self.state.set_op(op, copy);
        info!(book_id = %self.state.book_id(), op = %op, "Book op complete");
        Ok(())
    }

    /// Checkpoint an agent's conversation
    pub(crate) async fn persist_agent_state(&self, agent: &ToolLoopAgent, sync: bool) -> Result<()> {
        let snapshot = agent.export_state();
        let key = snapshot.unique_key(self.state.book_id());
        let body = json!({
            "book_id": self.state.book_id(),
            "agent_type": snapshot.agent_type,
            "instance_key": snapshot.instance_key,
            "complete": snapshot.complete,
            "state": serde_json::to_value(&snapshot)?,
        });

        let op = WriteOp::upsert_doc(AGENT_STATES, key, body);
        if sync {
            self.services.sink.send_sync(op).await?;
        } else {
            self.services.sink.send(op).await;
        }

        self.state.save_agent_state(snapshot);
        Ok(())
    }

    /// Flag a finished agent's checkpoint; loss is tolerated, orphan
    /// records are harmless
    pub(crate) async fn mark_agent_state_complete(&self, agent: &ToolLoopAgent) {
        let snapshot = agent.export_state();
        let key = snapshot.unique_key(self.state.book_id());
        self.services
            .sink
            .send(WriteOp::Upsert {
                collection: AGENT_STATES.to_string(),
                unique_key: key,
                create: json!({"complete": true}),
                patch: json!({"complete": true}),
            })
            .await;
        self.state.remove_agent_state(agent.agent_type(), agent.instance_key());
    }

    // === metadata ===

    pub(crate) async fn handle_metadata(&self, result: &WorkResult) -> Result<Vec<WorkUnit>> {
        let chat = result.chat().ok_or_else(|| eyre!("metadata unit returned wrong outcome"))?;
        let parsed = chat
            .parsed_json
            .as_ref()
            .ok_or_else(|| eyre!("metadata returned no structured result"))?;

        let metadata: BookMetadata =
            serde_json::from_value(parsed.clone()).map_err(|e| eyre!("metadata did not parse: {e}"))?;

        self.complete_book_op(
            BookOp::Metadata,
            json!({
                "title": metadata.title,
                "author": metadata.author,
                "publisher": metadata.publisher,
                "year": metadata.year,
                "language": metadata.language,
            }),
        )
        .await?;
        self.state.set_metadata(metadata);

        Ok(Vec::new())
    }

    // === toc_finder ===

    pub(crate) async fn handle_toc_finder(&self, result: &WorkResult) -> Result<Vec<WorkUnit>> {
        let chat = result.chat().ok_or_else(|| eyre!("toc finder unit returned wrong outcome"))?;
        let key = (AgentType::TocFinder, toc_finder::INSTANCE_KEY.to_string());

        let mut agents = self.agents.lock().await;
        let Some(agent) = agents.get_mut(&key) else {
            warn!(book_id = %self.state.book_id(), "No live toc finder for result");
            return Ok(Vec::new());
        };

        let ctx = ToolContext::new(self.state.clone());
        agent.handle_llm_result(chat, &ctx).await;

        if !agent.is_done() {
            let unit = self.agent_unit(
                agent,
                WorkUnitInfo::book(UnitKind::TocFinder),
                "toc_find",
                "toc".to_string(),
                "toc_find_system",
            );
            if let Some(unit) = unit {
                return Ok(vec![unit]);
            }
            // next_request exhausted the iteration budget
        }

        let agent = agents.remove(&key).expect("agent present");
        drop(agents);
        self.finish_toc_finder(agent).await
    }

    async fn finish_toc_finder(&self, agent: ToolLoopAgent) -> Result<Vec<WorkUnit>> {
        self.mark_agent_state_complete(&agent).await;

        if !agent.success() {
            return Err(eyre!("toc finder agent gave up"));
        }
        let parsed = agent
            .result_json()
            .ok_or_else(|| eyre!("toc finder finished without a result"))?;
        let found = TocFinderResult::from_json(parsed);

        let receipt = persist_critical(
            &self.services.sink,
            WriteOp::upsert_doc(
                TOCS,
                format!("{}:toc", self.state.book_id()),
                json!({
                    "book_id": self.state.book_id(),
                    "found": found.found,
                    "start_page": found.start_page,
                    "end_page": found.end_page,
                }),
            ),
            "toc document",
        )
        .await?;

        self.state.set_toc(TocInfo {
            doc_id: Some(receipt.doc_id),
            found: found.found,
            start_page: found.start_page,
            end_page: found.end_page,
        });

        self.complete_book_op(BookOp::TocFinder, json!({"toc_found": found.found}))
            .await?;

        info!(
            book_id = %self.state.book_id(),
            found = found.found,
            start = ?found.start_page,
            end = ?found.end_page,
            "ToC search finished"
        );
        Ok(Vec::new())
    }

    // === toc_extract ===

    pub(crate) async fn handle_toc_extract(&self, result: &WorkResult) -> Result<Vec<WorkUnit>> {
        let chat = result.chat().ok_or_else(|| eyre!("toc extract unit returned wrong outcome"))?;
        let parsed = chat
            .parsed_json
            .as_ref()
            .ok_or_else(|| eyre!("toc extract returned no structured result"))?;
        let entries = parsed["entries"]
            .as_array()
            .ok_or_else(|| eyre!("toc extract result missing entries"))?;

        let toc = self.state.toc();
        let toc_doc_id = toc.doc_id.ok_or_else(|| eyre!("toc extract before toc document"))?;

        for (index, entry) in entries.iter().enumerate() {
            let body = json!({
                "book_id": self.state.book_id(),
                "toc_id": toc_doc_id,
                "unique_key": format!("{toc_doc_id}:toc:{index}"),
                "title": entry["title"].as_str().unwrap_or_default(),
                "level": entry["level"].as_u64().unwrap_or(0),
                "identifier": entry["identifier"].as_str(),
                "printed_page": entry["printed_page"].as_str(),
                "actual_page": Value::Null,
                "actual_page_id": Value::Null,
                "sort_order": (index as i64 + 1) * 100,
                "source": "toc",
            });
            self.services
                .sink
                .send(WriteOp::upsert_doc(TOC_ENTRIES, format!("{toc_doc_id}:toc:{index}"), body))
                .await;
        }

        // Flush, then reload: the in-memory list must reflect committed
        // documents with their doc ids
        self.services.sink.flush().await?;
        self.reload_entries(&toc_doc_id)?;

        self.complete_book_op(BookOp::TocExtract, json!({})).await?;
        info!(book_id = %self.state.book_id(), entries = entries.len(), "ToC extracted");
        Ok(Vec::new())
    }

    /// Replace the in-memory entry list from the store
    pub(crate) fn reload_entries(&self, toc_doc_id: &str) -> Result<()> {
        let docs = self
            .services
            .store
            .query(TOC_ENTRIES, &[Filter::eq("toc_id", toc_doc_id)])?;

        let mut entries: Vec<TocEntry> = docs
            .iter()
            .map(|doc| TocEntry::from_doc(&doc.doc_id, &doc.body))
            .collect();
        entries.sort_by_key(|e| e.sort_order);

        self.state.set_entries(entries);
        Ok(())
    }

    // === pattern_analysis ===

    pub(crate) async fn handle_pattern(&self, info: &WorkUnitInfo, result: &WorkResult) -> Result<Vec<WorkUnit>> {
        let subtype = info
            .pattern_subtype
            .ok_or_else(|| eyre!("pattern unit without subtype"))?;
        let chat = result.chat().ok_or_else(|| eyre!("pattern unit returned wrong outcome"))?;
        let parsed = chat
            .parsed_json
            .clone()
            .ok_or_else(|| eyre!("pattern returned no structured result"))?;

        match subtype {
            PatternSubtype::PageNumbers | PatternSubtype::ChapterPatterns => {
                let (both_in, dispatched) = self.state.record_pattern_partial(subtype, parsed);
                if both_in && !dispatched {
                    self.state.mark_boundaries_dispatched();
                    return Ok(vec![self.pattern_unit(PatternSubtype::BodyBoundaries)?]);
                }
                Ok(Vec::new())
            }

            PatternSubtype::BodyBoundaries => {
                let (page_numbers, chapters) = self
                    .state
                    .pattern_partials()
                    .ok_or_else(|| eyre!("boundaries completed before prerequisites"))?;

                let aggregate = PatternAnalysisResult {
                    page_number_pattern: page_numbers["pattern"].as_str().unwrap_or_default().to_string(),
                    chapter_patterns: chapters["patterns"]
                        .as_array()
                        .map(|a| {
                            a.iter()
                                .filter_map(|v| v.as_str().map(String::from))
                                .collect()
                        })
                        .unwrap_or_default(),
                    body_start: parsed["body_start"].as_u64().map(|p| p as u32),
                    body_end: parsed["body_end"].as_u64().map(|p| p as u32),
                    reasoning: parsed["reasoning"].as_str().unwrap_or_default().to_string(),
                };

                self.state.set_pattern(aggregate.clone());
                self.complete_book_op(
                    BookOp::PatternAnalysis,
                    json!({"pattern_analysis_json": serde_json::to_value(&aggregate)?}),
                )
                .await?;

                // Labels were gated on pattern analysis; release them
                let mut units = Vec::new();
                for page in self.state.pages_awaiting_label() {
                    units.extend(self.generate_page_work_units(page)?);
                }
                debug!(book_id = %self.state.book_id(), labels = units.len(), "Pattern analysis complete");
                Ok(units)
            }
        }
    }

    // === toc_link ===

    /// Fan out one entry finder per unlinked entry. Agents are created,
    /// their initial states batch-persisted, then the first units emitted.
    pub(crate) async fn start_link_agents(&self) -> Result<Vec<WorkUnit>> {
        let unlinked = self.state.unlinked_entries();
        if unlinked.is_empty() {
            self.complete_book_op(BookOp::TocLink, json!({})).await?;
            return Ok(Vec::new());
        }

        let mut created = Vec::with_capacity(unlinked.len());
        for entry in &unlinked {
            let mut agent = entry_finder::new_agent(&self.state, entry, self.budgets())?;
            if let Some(saved) = self.state.agent_state(AgentType::TocEntryFinder, &entry.doc_id)
                && !saved.complete
            {
                debug!(entry = %entry.doc_id, iteration = saved.iteration, "Rehydrating entry finder");
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
            let entry_doc_id = agent.instance_key().to_string();
            let info = WorkUnitInfo::book(UnitKind::TocLink).with_entry(entry_doc_id.clone());
            match self.agent_unit(&mut agent, info, "toc_link", format!("entry:{entry_doc_id}"), "entry_find_system") {
                Some(unit) => {
                    units.push(unit);
                    agents.insert((AgentType::TocEntryFinder, entry_doc_id), agent);
                }
                None => {
                    // A restored agent with an exhausted budget; leave the
                    // entry unlinked
                    warn!(entry = %entry_doc_id, "Entry finder unusable at start, leaving unlinked");
                    self.mark_agent_state_complete(&agent).await;
                }
            }
        }
        drop(agents);

        if units.is_empty() {
            self.complete_book_op(BookOp::TocLink, json!({})).await?;
        }

        info!(book_id = %self.state.book_id(), agents = units.len(), "Link fan-out started");
        Ok(units)
    }

    pub(crate) async fn handle_link(&self, info: &WorkUnitInfo, result: &WorkResult) -> Result<Vec<WorkUnit>> {
        let entry_doc_id = info
            .entry_doc_id
            .clone()
            .ok_or_else(|| eyre!("link unit without entry"))?;
        let chat = result.chat().ok_or_else(|| eyre!("link unit returned wrong outcome"))?;

        let key = (AgentType::TocEntryFinder, entry_doc_id.clone());
        let mut agents = self.agents.lock().await;
        let Some(agent) = agents.get_mut(&key) else {
            warn!(entry = %entry_doc_id, "No live entry finder for result");
            return Ok(Vec::new());
        };

        let ctx = ToolContext::new(self.state.clone());
        agent.handle_llm_result(chat, &ctx).await;

        if !agent.is_done() {
            // Checkpoint every turn: these loops are long and expensive
            self.persist_agent_state(agent, false).await?;

            let next_info = WorkUnitInfo::book(UnitKind::TocLink).with_entry(entry_doc_id.clone());
            if let Some(unit) = self.agent_unit(
                agent,
                next_info,
                "toc_link",
                format!("entry:{entry_doc_id}"),
                "entry_find_system",
            ) {
                return Ok(vec![unit]);
            }
        }

        let agent = agents.remove(&key).expect("agent present");
        drop(agents);
        self.finish_link_entry(agent).await
    }

    async fn finish_link_entry(&self, agent: ToolLoopAgent) -> Result<Vec<WorkUnit>> {
        let entry_doc_id = agent.instance_key().to_string();
        self.mark_agent_state_complete(&agent).await;

        if !agent.success() {
            return self.retry_link_entry(&entry_doc_id).await;
        }

        let found = agent.result_json().map(EntryFindResult::from_json).unwrap_or_default();

        if let (true, Some(page)) = (found.found, found.scan_page) {
            match self.state.page_doc_id(page) {
                Some(page_doc_id) => {
                    persist_critical(
                        &self.services.sink,
                        WriteOp::update(
                            TOC_ENTRIES,
                            &entry_doc_id,
                            json!({"actual_page": page, "actual_page_id": page_doc_id}),
                        ),
                        "entry link",
                    )
                    .await?;

                    self.state.update_entry(&entry_doc_id, |e| {
                        e.actual_page = Some(page);
                        e.actual_page_id = Some(page_doc_id.clone());
                    });
                    info!(entry = %entry_doc_id, page, "Entry linked");
                }
                None => warn!(entry = %entry_doc_id, page, "Finder returned a page with no document"),
            }
        } else {
            info!(entry = %entry_doc_id, "Entry could not be located, staying unlinked");
        }

        self.after_link_entry_done().await
    }

    /// Per-entry retry budget; exhaustion leaves the entry unlinked and
    /// proceeds
    pub(crate) async fn retry_link_entry(&self, entry_doc_id: &str) -> Result<Vec<WorkUnit>> {
        self.drop_agent(AgentType::TocEntryFinder, entry_doc_id).await;

        let retries = self.bump_agent_retry(&format!("link:{entry_doc_id}"));
        if retries > self.services.engine.max_finalize_retries {
            warn!(entry = %entry_doc_id, retries, "Entry finder budget exhausted, leaving unlinked");
            return self.after_link_entry_done().await;
        }

        let Some(entry) = self.state.entries().into_iter().find(|e| e.doc_id == entry_doc_id) else {
            warn!(entry = %entry_doc_id, "Entry disappeared during retry");
            return self.after_link_entry_done().await;
        };

        debug!(entry = %entry_doc_id, attempt = retries + 1, "Retrying entry finder");
        let mut agent = entry_finder::new_agent(&self.state, &entry, self.budgets())?;
        self.persist_agent_state(&agent, false).await?;

        let info = WorkUnitInfo::book(UnitKind::TocLink).with_entry(entry_doc_id.to_string());
        let unit = self.agent_unit(
            &mut agent,
            info,
            "toc_link",
            format!("entry:{entry_doc_id}"),
            "entry_find_system",
        );

        match unit {
            Some(unit) => {
                self.agents
                    .lock()
                    .await
                    .insert((AgentType::TocEntryFinder, entry_doc_id.to_string()), agent);
                Ok(vec![unit])
            }
            None => self.after_link_entry_done().await,
        }
    }

    async fn after_link_entry_done(&self) -> Result<Vec<WorkUnit>> {
        let remaining = {
            let agents = self.agents.lock().await;
            agents
                .keys()
                .filter(|(agent_type, _)| *agent_type == AgentType::TocEntryFinder)
                .count()
        };

        if remaining == 0 && self.state.op(BookOp::TocLink).is_started() {
            let linked = self.state.linked_entries().len();
            let total = self.state.entries().len();
            info!(book_id = %self.state.book_id(), linked, total, "Link fan-out finished");
            self.complete_book_op(BookOp::TocLink, json!({})).await?;
        }
        Ok(Vec::new())
    }
}
