// src/service.rs

//! The facade external collaborators use; they never touch the store, index,
//! or compactor directly. Every mutation for a unit serializes behind that
//! unit's exclusive lock; cross-unit operations proceed independently. Query
//! embedding happens before the lock is taken.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::compact::{compact_record, keyword_tags, CompactionPlanner};
use crate::config::MemoryConfig;
use crate::embed::EmbeddingChain;
use crate::error::{MemoryError, Result};
use crate::index::UnitIndex;
use crate::model::{
    clean_tag, clean_tags, clean_text, new_id, now_utc, text_hash, Chunk, Debt, Event, Fact,
    IndexSource, LongTermRecord, MemoryItem, Promise, ShortTermEntry, Speaker, UnitId,
};
use crate::retrieval::{
    apply_tag_filter, candidate_from_hit, degraded_candidates, overlap_ratio, rank, tokenize,
    Candidate, MemoryFragment, RetrievedContext,
};
use crate::store::DurableStore;

/// Outcome of one `compact` invocation.
#[derive(Debug, Clone)]
pub struct CompactionResult {
    pub applied: bool,
    pub chunks_compacted: usize,
    pub patch_summary: String,
}

#[derive(Debug, Default)]
pub struct ConsistencyReport {
    pub units: usize,
    pub mapped_records: usize,
    pub dangling_refs: Vec<String>,
    pub corrupt_units: Vec<String>,
    pub stale_indexes: Vec<String>,
}

impl ConsistencyReport {
    pub fn is_clean(&self) -> bool {
        self.dangling_refs.is_empty() && self.corrupt_units.is_empty()
    }
}

pub(crate) struct UnitState {
    index: UnitIndex,
    index_loaded: bool,
}

pub struct MemoryService {
    config: MemoryConfig,
    store: DurableStore,
    chain: Arc<EmbeddingChain>,
    planner: Option<Arc<dyn CompactionPlanner>>,
    units: Mutex<HashMap<String, Arc<Mutex<UnitState>>>>,
}

impl MemoryService {
    pub fn new(config: MemoryConfig) -> Result<Self> {
        let store = DurableStore::new(&config.data_root)?;
        let chain = EmbeddingChain::from_config(&config, store.cache_path());
        Ok(Self {
            config,
            store,
            chain: Arc::new(chain),
            planner: None,
            units: Mutex::new(HashMap::new()),
        })
    }

    /// Builds the service around an explicit chain; used by tests and by
    /// hosts that wire their own tiers.
    pub fn with_chain(config: MemoryConfig, chain: EmbeddingChain) -> Result<Self> {
        let store = DurableStore::new(&config.data_root)?;
        Ok(Self {
            config,
            store,
            chain: Arc::new(chain),
            planner: None,
            units: Mutex::new(HashMap::new()),
        })
    }

    /// Installs the injected generative compaction capability.
    pub fn with_planner(mut self, planner: Arc<dyn CompactionPlanner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    // ── Unit locking ────────────────────────────────────────────────────

    async fn unit_state(&self, unit: &UnitId) -> Arc<Mutex<UnitState>> {
        let mut map = self.units.lock().await;
        map.entry(unit.stem())
            .or_insert_with(|| {
                Arc::new(Mutex::new(UnitState {
                    index: UnitIndex::new(unit.clone(), self.config.embed_dim),
                    index_loaded: false,
                }))
            })
            .clone()
    }

    pub(crate) async fn lock_unit(&self, unit: &UnitId) -> Result<OwnedMutexGuard<UnitState>> {
        let state = self.unit_state(unit).await;
        timeout(self.config.lock_wait, state.lock_owned())
            .await
            .map_err(|_| MemoryError::LockContention {
                unit: unit.to_string(),
            })
    }

    pub(crate) fn store(&self) -> &DurableStore {
        &self.store
    }

    pub(crate) fn load_or_empty(&self, unit: &UnitId) -> Result<LongTermRecord> {
        Ok(self
            .store
            .load(unit)?
            .unwrap_or_else(|| LongTermRecord::empty(unit)))
    }

    // ── Appending ───────────────────────────────────────────────────────

    /// Appends one short-term entry; compacts when the window overflows.
    /// Returns false when the text normalizes to nothing.
    pub async fn append_short(
        &self,
        unit: &UnitId,
        speaker: Speaker,
        text: &str,
        tags: &[String],
    ) -> Result<bool> {
        let Some(entry) = self.build_entry(speaker, text, tags, None) else {
            return Ok(false);
        };
        self.append_entries(unit, vec![entry]).await?;
        Ok(true)
    }

    /// Appends a paired player/NPC exchange under one shared turn id.
    pub async fn append_turn(
        &self,
        unit: &UnitId,
        player_text: &str,
        npc_text: &str,
        scene: Option<&str>,
    ) -> Result<()> {
        let turn_id = new_id();
        let scene_tags: Vec<String> = scene
            .map(|s| vec![clean_tag(s)])
            .unwrap_or_default()
            .into_iter()
            .filter(|t| !t.is_empty())
            .collect();
        let mut entries = Vec::new();
        if let Some(entry) = self.build_entry(Speaker::Player, player_text, &scene_tags, Some(&turn_id)) {
            entries.push(entry);
        }
        if let Some(entry) = self.build_entry(Speaker::Npc, npc_text, &scene_tags, Some(&turn_id)) {
            entries.push(entry);
        }
        if entries.is_empty() {
            return Ok(());
        }
        self.append_entries(unit, entries).await
    }

    fn build_entry(
        &self,
        speaker: Speaker,
        text: &str,
        tags: &[String],
        turn_id: Option<&str>,
    ) -> Option<ShortTermEntry> {
        let text = clean_text(text, 460);
        if text.is_empty() {
            return None;
        }
        let mut all_tags: Vec<String> = tags.to_vec();
        all_tags.push(speaker.as_tag().to_string());
        all_tags.extend(keyword_tags(&text));
        Some(ShortTermEntry {
            turn_id: turn_id.map(str::to_string).unwrap_or_else(new_id),
            speaker,
            tags: clean_tags(&all_tags),
            importance: match speaker {
                Speaker::Player => 0.5,
                Speaker::Npc => 0.48,
                _ => 0.45,
            },
            created_at: now_utc(),
            text,
        })
    }

    async fn append_entries(&self, unit: &UnitId, entries: Vec<ShortTermEntry>) -> Result<()> {
        let mut state = self.lock_unit(unit).await?;
        let mut short = self.store.read_short(unit)?;
        for entry in entries {
            self.store.append_short(unit, &entry)?;
            short.push(entry);
        }
        let mut record = self.load_or_empty(unit)?;
        record.limits.short_max = self.config.short_max;
        record.limits.chunk_turns = self.config.chunk_turns;

        let outcome = compact_record(&mut record, &mut short, self.planner.as_deref()).await;
        // Patch commits with the document, eviction with the short log, in
        // that order. A failure between the two leaves the window overfull;
        // the retry re-derives the same patch, which deduplicates to a
        // no-op, then finishes the eviction.
        self.store.save(unit, &record)?;
        if outcome.applied {
            self.store.write_short(unit, &short)?;
            info!(unit = %unit, chunks = outcome.chunks_compacted, "short-term window compacted");
            self.index_chunks(unit, &mut state, &outcome.new_chunks).await;
        }
        Ok(())
    }

    /// The unit's current short-term window, oldest first.
    pub async fn read_short(&self, unit: &UnitId) -> Result<Vec<ShortTermEntry>> {
        let _state = self.lock_unit(unit).await?;
        self.store.read_short(unit)
    }

    // ── Structured appends ──────────────────────────────────────────────

    /// Records a structured long-term item directly, deduplicated against
    /// the existing collections.
    pub async fn remember(&self, unit: &UnitId, item: MemoryItem) -> Result<()> {
        let mut state = self.lock_unit(unit).await?;
        let mut record = self.load_or_empty(unit)?;
        let source = Self::apply_item(&mut record, item);
        record.enforce_caps();
        self.store.save(unit, &record)?;

        if let Some(source) = source {
            self.index_sources(unit, &mut state, &[source]).await;
        }
        Ok(())
    }

    /// Folds the item into the record; returns the embeddable source when a
    /// new record was actually added.
    fn apply_item(record: &mut LongTermRecord, item: MemoryItem) -> Option<IndexSource> {
        let now = now_utc();
        match item {
            MemoryItem::Fact {
                subject,
                predicate,
                object,
                confidence,
            } => {
                let fact = Fact {
                    id: new_id(),
                    subject: clean_text(&subject, 120),
                    predicate: clean_text(&predicate, 120),
                    object: clean_text(&object, 420),
                    confidence: confidence.clamp(0.0, 1.0),
                    tags: clean_tags(&keyword_tags(&object)),
                    importance: 0.55,
                    created_at: now,
                    text_hash: String::new(),
                };
                if fact.object.is_empty() {
                    return None;
                }
                let fact = Fact {
                    text_hash: text_hash(&fact.render()),
                    ..fact
                };
                let key = fact.triple_key();
                if record.facts.iter().any(|f| f.triple_key() == key) {
                    return None;
                }
                let source = IndexSource {
                    source_ref: format!("fact:{}", fact.id),
                    kind: "fact".to_string(),
                    text: fact.render(),
                    tags: fact.tags.clone(),
                    importance: fact.importance,
                    created_at: now,
                };
                record.facts.push(fact);
                Some(source)
            }
            MemoryItem::Event {
                description,
                participants,
                impact,
            } => {
                let description = clean_text(&description, 420);
                if description.is_empty() {
                    return None;
                }
                let hash = text_hash(&description);
                if record.events.iter().any(|e| e.text_hash == hash) {
                    return None;
                }
                let event = Event {
                    id: new_id(),
                    tags: clean_tags(&keyword_tags(&description)),
                    importance: 0.62,
                    created_at: now,
                    text_hash: hash,
                    participants,
                    impact,
                    description,
                };
                let source = IndexSource {
                    source_ref: format!("event:{}", event.id),
                    kind: "event".to_string(),
                    text: event.description.clone(),
                    tags: event.tags.clone(),
                    importance: event.importance,
                    created_at: now,
                };
                record.events.push(event);
                Some(source)
            }
            MemoryItem::Promise { description, due } => {
                let description = clean_text(&description, 420);
                if description.is_empty() {
                    return None;
                }
                let hash = text_hash(&description);
                if record.promises.iter().any(|p| p.text_hash == hash) {
                    return None;
                }
                let promise = Promise {
                    id: new_id(),
                    status: Default::default(),
                    tags: {
                        let mut tags = keyword_tags(&description);
                        if !tags.iter().any(|t| t == "promise") {
                            tags.push("promise".to_string());
                        }
                        clean_tags(&tags)
                    },
                    importance: 0.7,
                    created_at: now,
                    text_hash: hash,
                    description,
                    due,
                };
                let source = IndexSource {
                    source_ref: format!("promise:{}", promise.id),
                    kind: "promise".to_string(),
                    text: promise.description.clone(),
                    tags: promise.tags.clone(),
                    importance: promise.importance,
                    created_at: now,
                };
                record.promises.push(promise);
                Some(source)
            }
            MemoryItem::Debt {
                kind,
                detail,
                owed_by,
                owed_to,
            } => {
                let detail = clean_text(&detail, 420);
                if detail.is_empty() {
                    return None;
                }
                let hash = text_hash(&detail);
                if record.debts.iter().any(|d| d.text_hash == hash) {
                    return None;
                }
                let debt = Debt {
                    id: new_id(),
                    kind: clean_text(&kind, 60),
                    owed_by: clean_text(&owed_by, 120),
                    owed_to: clean_text(&owed_to, 120),
                    status: Default::default(),
                    tags: {
                        let mut tags = keyword_tags(&detail);
                        if !tags.iter().any(|t| t == "debt") {
                            tags.push("debt".to_string());
                        }
                        clean_tags(&tags)
                    },
                    importance: 0.7,
                    created_at: now,
                    text_hash: hash,
                    detail,
                };
                let source = IndexSource {
                    source_ref: format!("debt:{}", debt.id),
                    kind: "debt".to_string(),
                    text: debt.render(),
                    tags: debt.tags.clone(),
                    importance: debt.importance,
                    created_at: now,
                };
                record.debts.push(debt);
                Some(source)
            }
            MemoryItem::Relationship { target, delta, note } => {
                let target = clean_tag(&target);
                if target.is_empty() {
                    return None;
                }
                let relationship = record.relationships.entry(target).or_default();
                relationship.adjust(delta);
                if let Some(note) = note {
                    relationship.add_note(&note, now);
                }
                None
            }
        }
    }

    // ── Compaction ──────────────────────────────────────────────────────

    /// Compacts the unit if its window is over capacity.
    pub async fn compact(&self, unit: &UnitId) -> Result<CompactionResult> {
        let mut state = self.lock_unit(unit).await?;
        let mut record = self.load_or_empty(unit)?;
        let mut short = self.store.read_short(unit)?;
        let outcome = compact_record(&mut record, &mut short, self.planner.as_deref()).await;
        if !outcome.applied {
            return Ok(CompactionResult {
                applied: false,
                chunks_compacted: 0,
                patch_summary: String::new(),
            });
        }
        self.store.save(unit, &record)?;
        self.store.write_short(unit, &short)?;
        self.index_chunks(unit, &mut state, &outcome.new_chunks).await;
        Ok(CompactionResult {
            applied: true,
            chunks_compacted: outcome.chunks_compacted,
            patch_summary: outcome.patch_summary,
        })
    }

    // ── Incremental indexing (best effort; rebuild heals) ───────────────

    async fn index_chunks(&self, unit: &UnitId, state: &mut UnitState, chunks: &[Chunk]) {
        let sources: Vec<IndexSource> = chunks
            .iter()
            .map(|chunk| IndexSource {
                source_ref: format!("chunk:{}", chunk.chunk_id),
                kind: "chunk".to_string(),
                text: clean_text(&chunk.digest, 1000),
                tags: chunk.tags.clone(),
                importance: chunk.importance,
                created_at: chunk.last_at,
            })
            .collect();
        self.index_sources(unit, state, &sources).await;
    }

    async fn index_sources(&self, unit: &UnitId, state: &mut UnitState, sources: &[IndexSource]) {
        if sources.is_empty() {
            return;
        }
        if let Err(err) = self.ensure_index_loaded(unit, state) {
            warn!(unit = %unit, %err, "index load failed, skipping incremental add");
            return;
        }
        let texts: Vec<String> = sources.iter().map(|s| s.text.clone()).collect();
        let vectors = self.chain.embed_all(&texts).await;
        let mut added = 0;
        for (source, vector) in sources.iter().zip(vectors) {
            if let Some(vector) = vector {
                state.index.add(source, vector);
                added += 1;
            }
        }
        if added == 0 {
            debug!(unit = %unit, "no embedding backend, records stay unindexed until rebuild");
            return;
        }
        if let Err(err) = state.index.persist(&self.store) {
            warn!(unit = %unit, %err, "index persist failed, a rebuild will recover");
        }
    }

    fn ensure_index_loaded(&self, unit: &UnitId, state: &mut UnitState) -> Result<()> {
        if state.index_loaded {
            return Ok(());
        }
        state.index.load(&self.store)?;
        state.index_loaded = true;
        Ok(())
    }

    // ── Retrieval ───────────────────────────────────────────────────────

    /// Hybrid retrieval over one unit. Degrades to tag/keyword matching when
    /// no embedding backend is available; never mutates.
    pub async fn retrieve(
        &self,
        unit: &UnitId,
        query: &str,
        k: usize,
        tag_filter: &[String],
    ) -> Result<Vec<MemoryFragment>> {
        // Embed outside the unit lock; the provider call may be slow.
        let query_vec = self.chain.embed_text(query).await.ok();
        let mut state = self.lock_unit(unit).await?;
        let record = self.load_or_empty(unit)?;
        self.ranked_fragments(unit, &mut state, &record, query, query_vec, k, tag_filter)
            .await
    }

    async fn ranked_fragments(
        &self,
        unit: &UnitId,
        state: &mut UnitState,
        record: &LongTermRecord,
        query: &str,
        query_vec: Option<Vec<f32>>,
        k: usize,
        tag_filter: &[String],
    ) -> Result<Vec<MemoryFragment>> {
        let k = k.max(1);
        let query_tokens = tokenize(query);
        self.ensure_index_loaded(unit, state)?;

        let candidates: Vec<Candidate> = match &query_vec {
            Some(query_vec) => {
                if state.index.is_empty() && !record.index_sources().is_empty() {
                    // Index never built (or wiped); heal it now.
                    state.index.rebuild(&self.chain, record).await;
                    if let Err(err) = state.index.persist(&self.store) {
                        warn!(unit = %unit, %err, "index persist failed after rebuild");
                    }
                }
                let oversample = (k * 4).max(20);
                state
                    .index
                    .search(query_vec, oversample)
                    .iter()
                    .map(|(record, similarity)| candidate_from_hit(record, *similarity))
                    .collect()
            }
            None => degraded_candidates(record, &query_tokens),
        };

        let candidates = apply_tag_filter(candidates, tag_filter);
        Ok(rank(
            candidates,
            &query_tokens,
            now_utc(),
            self.config.recency_tau_hours,
            k,
        ))
    }

    /// Prompt-assembly view: recent short-term lines, the strongest
    /// long-term lines, and the retrieved fragments, each bounded by the
    /// configured limits.
    pub async fn retrieve_context(&self, unit: &UnitId, query: &str) -> Result<RetrievedContext> {
        let query_vec = self.chain.embed_text(query).await.ok();
        let mut state = self.lock_unit(unit).await?;
        let record = self.load_or_empty(unit)?;
        let short = self.store.read_short(unit)?;
        let query_tokens = tokenize(query);
        let now = now_utc();

        let short_lines: Vec<String> = short
            .iter()
            .rev()
            .take(self.config.short_limit)
            .rev()
            .map(|entry| {
                format!(
                    "- [short {}] {}",
                    entry.created_at.format("%Y-%m-%d"),
                    clean_text(&entry.text, 180)
                )
            })
            .collect();

        // Long-term lines are ranked with token overlap standing in for the
        // vector term, so they stay useful with no backend at all.
        let long_candidates: Vec<Candidate> = record
            .index_sources()
            .into_iter()
            .filter(|s| s.kind != "chunk")
            .map(|s| {
                let sim = overlap_ratio(&query_tokens, &tokenize(&s.text));
                Candidate {
                    source_ref: s.source_ref,
                    kind: s.kind,
                    text: clean_text(&s.text, 220),
                    tags: s.tags,
                    importance: s.importance,
                    created_at: s.created_at,
                    vector_sim: sim,
                }
            })
            .collect();
        let long_lines: Vec<String> = rank(
            long_candidates,
            &query_tokens,
            now,
            self.config.recency_tau_hours,
            self.config.long_limit,
        )
        .into_iter()
        .map(|f| format!("- [{}] {}", f.kind, f.text))
        .collect();

        let retrieved_lines: Vec<String> = self
            .ranked_fragments(
                unit,
                &mut state,
                &record,
                query,
                query_vec,
                self.config.retrieved_limit,
                &[],
            )
            .await?
            .into_iter()
            .map(|f| {
                format!(
                    "- [{} {}] {}",
                    f.kind,
                    f.created_at.format("%Y-%m-%d"),
                    f.text
                )
            })
            .collect();

        Ok(RetrievedContext {
            short_lines,
            long_lines,
            retrieved_lines,
        })
    }

    // ── Index maintenance ───────────────────────────────────────────────

    /// Recomputes the unit's index from its current document, discarding the
    /// prior index entirely. Idempotent.
    pub async fn rebuild_index(&self, unit: &UnitId) -> Result<usize> {
        let mut state = self.lock_unit(unit).await?;
        let record = self.load_or_empty(unit)?;
        let added = state.index.rebuild(&self.chain, &record).await;
        state.index.persist(&self.store)?;
        state.index_loaded = true;
        Ok(added)
    }

    /// Rebuilds every unit's index, optionally restricted to one profile.
    pub async fn rebuild_all(&self, profile: Option<&str>) -> Result<usize> {
        let mut total = 0;
        for unit in self.store.list_units(profile)? {
            total += self.rebuild_index(&unit).await?;
        }
        Ok(total)
    }

    pub fn list_units(&self, profile: Option<&str>) -> Result<Vec<UnitId>> {
        self.store.list_units(profile)
    }

    pub fn load_record(&self, unit: &UnitId) -> Result<Option<LongTermRecord>> {
        self.store.load(unit)
    }

    // ── Purging ─────────────────────────────────────────────────────────

    /// Removes the unit's document, mapping, and vector blob.
    pub async fn purge(&self, unit: &UnitId) -> Result<()> {
        let mut state = self.lock_unit(unit).await?;
        self.store.purge(unit)?;
        state.index.clear();
        state.index_loaded = true;
        info!(unit = %unit, "unit purged");
        Ok(())
    }

    /// Clears only the rolling short-term window.
    pub async fn purge_short(&self, unit: &UnitId) -> Result<bool> {
        let _state = self.lock_unit(unit).await?;
        if self.store.read_short(unit)?.is_empty() {
            return Ok(false);
        }
        self.store.write_short(unit, &[])?;
        Ok(true)
    }

    /// Drops every cached embedding. The only way cache entries die.
    pub async fn purge_cache(&self) -> Result<()> {
        self.chain.purge_cache().await
    }

    // ── Consistency ─────────────────────────────────────────────────────

    /// Validates that every mapped index record resolves to a live record in
    /// its unit's document, and that vector blobs agree with their mappings.
    pub async fn check_consistency(&self) -> Result<ConsistencyReport> {
        let mut report = ConsistencyReport::default();
        for unit in self.store.list_units(None)? {
            report.units += 1;
            let record = match self.store.load(&unit) {
                Ok(Some(record)) => record,
                Ok(None) => LongTermRecord::empty(&unit),
                Err(MemoryError::CorruptState { .. }) => {
                    report.corrupt_units.push(unit.to_string());
                    continue;
                }
                Err(err) => return Err(err),
            };
            let mapping = self.store.read_mapping(&unit)?;
            report.mapped_records += mapping.len();
            for row in &mapping {
                if !record.resolves(&row.source_ref) {
                    report
                        .dangling_refs
                        .push(format!("{}: {}", unit, row.source_ref));
                }
            }
            match self.store.read_vectors(&unit)? {
                Some((dim, rows)) => {
                    if dim != self.config.embed_dim || rows.len() != mapping.len() {
                        report.stale_indexes.push(unit.to_string());
                    }
                }
                None if !mapping.is_empty() => report.stale_indexes.push(unit.to_string()),
                None => {}
            }
        }
        Ok(report)
    }
}
