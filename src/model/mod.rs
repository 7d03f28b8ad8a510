// src/model/mod.rs

//! Schema-versioned record definitions for short-term entries and the
//! long-term structured record, plus the normalization helpers every layer
//! shares (text cleaning, tag cleaning, content hashing).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Current document schema version. Readers upgrade older documents before
/// use; writers always emit this version and never downgrade.
pub const SCHEMA_VERSION: u32 = 2;

pub const FACT_CAP: usize = 500;
pub const EVENT_CAP: usize = 500;
pub const PROMISE_CAP: usize = 100;
pub const DEBT_CAP: usize = 100;
pub const CHUNK_CAP: usize = 2000;
pub const RELATIONSHIP_NOTE_CAP: usize = 300;

pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Collapses whitespace and truncates with an ellipsis.
pub fn clean_text(value: &str, max_len: usize) -> String {
    let mut out = String::with_capacity(value.len().min(max_len));
    let mut last_space = true;
    for ch in value.chars() {
        if ch.is_whitespace() {
            if !last_space {
                out.push(' ');
                last_space = true;
            }
        } else {
            out.push(ch);
            last_space = false;
        }
    }
    let trimmed = out.trim_end();
    if trimmed.chars().count() <= max_len {
        return trimmed.to_string();
    }
    let keep = max_len.saturating_sub(3).max(1);
    let cut: String = trimmed.chars().take(keep).collect();
    format!("{}...", cut.trim_end())
}

/// Lowercases and restricts a tag to `[a-z0-9:_-]`, max 48 chars.
pub fn clean_tag(value: &str) -> String {
    let mut out = String::new();
    let mut last_underscore = false;
    for ch in value.trim().to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, ':' | '_' | '-') {
            out.push(ch);
            last_underscore = false;
        } else if !last_underscore {
            out.push('_');
            last_underscore = true;
        }
    }
    out.trim_matches('_').chars().take(48).collect()
}

/// Deduplicating tag normalizer; keeps first occurrence order, caps at 24.
pub fn clean_tags(values: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for raw in values {
        let tag = clean_tag(raw);
        if !tag.is_empty() && !out.contains(&tag) {
            out.push(tag);
        }
    }
    out.truncate(24);
    out
}

/// Content hash over casefolded, whitespace-collapsed text. Used for
/// deduplication and for stable vector ids.
pub fn text_hash(value: &str) -> String {
    let normalized = clean_text(&value.to_lowercase(), usize::MAX);
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

/// Restricts an identifier to `[A-Za-z0-9._:-]`, max 180 chars.
pub fn safe_key(value: &str) -> String {
    let mut out = String::new();
    let mut last_underscore = false;
    for ch in value.trim().chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '.' | ':' | '-') {
            out.push(ch);
            last_underscore = false;
        } else if !last_underscore {
            out.push('_');
            last_underscore = true;
        }
    }
    let cleaned: String = out.trim_matches(|c| matches!(c, '.' | '_' | '-')).chars().take(180).collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

// ─── Unit identity ──────────────────────────────────────────────────────

/// The smallest addressable memory scope: one NPC within a profile, or the
/// profile's shared world scope. Exactly one writer at a time per unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnitId {
    pub profile: String,
    pub scope: UnitScope,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UnitScope {
    Npc(String),
    World,
}

impl UnitId {
    pub fn npc(profile: &str, npc: &str) -> Self {
        Self {
            profile: safe_key(profile),
            scope: UnitScope::Npc(safe_key(npc)),
        }
    }

    pub fn world(profile: &str) -> Self {
        Self {
            profile: safe_key(profile),
            scope: UnitScope::World,
        }
    }

    pub fn is_world(&self) -> bool {
        matches!(self.scope, UnitScope::World)
    }

    /// Filesystem stem, `<profile>__<npc>` or `<profile>__world`.
    pub fn stem(&self) -> String {
        match &self.scope {
            UnitScope::Npc(npc) => format!("{}__{}", self.profile, npc),
            UnitScope::World => format!("{}__world", self.profile),
        }
    }

    /// Inverse of [`UnitId::stem`]; `None` if the stem has no separator.
    pub fn from_stem(stem: &str) -> Option<Self> {
        let (profile, rest) = stem.split_once("__")?;
        if profile.is_empty() || rest.is_empty() {
            return None;
        }
        Some(if rest == "world" {
            Self::world(profile)
        } else {
            Self::npc(profile, rest)
        })
    }
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.scope {
            UnitScope::Npc(npc) => write!(f, "{}/{}", self.profile, npc),
            UnitScope::World => write!(f, "{}/world", self.profile),
        }
    }
}

// ─── Short-term window ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Player,
    Npc,
    System,
    Narration,
}

impl Speaker {
    pub fn as_tag(&self) -> &'static str {
        match self {
            Speaker::Player => "player",
            Speaker::Npc => "npc",
            Speaker::System => "system",
            Speaker::Narration => "narration",
        }
    }
}

impl Default for Speaker {
    fn default() -> Self {
        Speaker::Npc
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShortTermEntry {
    #[serde(default = "new_id")]
    pub turn_id: String,
    #[serde(default)]
    pub speaker: Speaker,
    pub text: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_importance")]
    pub importance: f32,
    #[serde(default = "now_utc")]
    pub created_at: DateTime<Utc>,
}

impl ShortTermEntry {
    pub fn new(speaker: Speaker, text: &str) -> Self {
        Self {
            turn_id: new_id(),
            speaker,
            text: clean_text(text, 460),
            tags: Vec::new(),
            importance: 0.45,
            created_at: now_utc(),
        }
    }
}

fn default_importance() -> f32 {
    0.5
}

// ─── Long-term collections ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    #[serde(default = "new_id")]
    pub id: String,
    pub subject: String,
    pub predicate: String,
    pub object: String,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_importance")]
    pub importance: f32,
    #[serde(default = "now_utc")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub text_hash: String,
}

fn default_confidence() -> f32 {
    0.65
}

impl Fact {
    /// Normalized dedup key over the (subject, predicate, object) triple.
    pub fn triple_key(&self) -> String {
        text_hash(&format!("{}|{}|{}", self.subject, self.predicate, self.object))
    }

    /// Flat rendering used for embedding and display.
    pub fn render(&self) -> String {
        clean_text(&format!("{} {} {}", self.subject, self.predicate, self.object), 420)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Impact {
    Low,
    Med,
    High,
}

impl Default for Impact {
    fn default() -> Self {
        Impact::Low
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(default = "new_id")]
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default)]
    pub impact: Impact,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_importance")]
    pub importance: f32,
    #[serde(default = "now_utc")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub text_hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromiseStatus {
    Open,
    Fulfilled,
    Broken,
}

impl Default for PromiseStatus {
    fn default() -> Self {
        PromiseStatus::Open
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Promise {
    #[serde(default = "new_id")]
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub status: PromiseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_importance")]
    pub importance: f32,
    #[serde(default = "now_utc")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub text_hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DebtStatus {
    Open,
    Settled,
}

impl Default for DebtStatus {
    fn default() -> Self {
        DebtStatus::Open
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Debt {
    #[serde(default = "new_id")]
    pub id: String,
    /// "coin", "favor", "item", …
    pub kind: String,
    /// Amount or free-form description of what is owed.
    pub detail: String,
    pub owed_by: String,
    pub owed_to: String,
    #[serde(default)]
    pub status: DebtStatus,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_importance")]
    pub importance: f32,
    #[serde(default = "now_utc")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub text_hash: String,
}

impl Debt {
    pub fn render(&self) -> String {
        clean_text(
            &format!("{} owes {} {} ({})", self.owed_by, self.owed_to, self.detail, self.kind),
            420,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipNote {
    pub text: String,
    #[serde(default = "now_utc")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Relationship {
    /// Clamped to [-100, 100].
    #[serde(default)]
    pub disposition: i32,
    #[serde(default)]
    pub notes: Vec<RelationshipNote>,
}

impl Relationship {
    pub fn adjust(&mut self, delta: i32) {
        self.disposition = (self.disposition + delta.clamp(-5, 5)).clamp(-100, 100);
    }

    pub fn add_note(&mut self, text: &str, at: DateTime<Utc>) {
        let text = clean_text(text, 280);
        if text.is_empty() {
            return;
        }
        self.notes.push(RelationshipNote { text, created_at: at });
        if self.notes.len() > RELATIONSHIP_NOTE_CAP {
            let excess = self.notes.len() - RELATIONSHIP_NOTE_CAP;
            self.notes.drain(..excess);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    #[serde(default)]
    pub text: String,
    #[serde(default = "now_utc")]
    pub updated_at: DateTime<Utc>,
}

impl Default for Summary {
    fn default() -> Self {
        Self {
            text: String::new(),
            updated_at: now_utc(),
        }
    }
}

/// A compacted slice of conversation; the unit the vector index stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    #[serde(default = "new_id")]
    pub chunk_id: String,
    pub first_at: DateTime<Utc>,
    pub last_at: DateTime<Utc>,
    #[serde(default)]
    pub turn_ids: Vec<String>,
    pub digest: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_importance")]
    pub importance: f32,
    #[serde(default)]
    pub text_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitLimits {
    #[serde(default = "default_short_max")]
    pub short_max: usize,
    #[serde(default = "default_chunk_turns")]
    pub chunk_turns: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_compacted_at: Option<DateTime<Utc>>,
}

fn default_short_max() -> usize {
    60
}

fn default_chunk_turns() -> usize {
    40
}

impl Default for UnitLimits {
    fn default() -> Self {
        Self {
            short_max: default_short_max(),
            chunk_turns: default_chunk_turns(),
            last_compacted_at: None,
        }
    }
}

impl UnitLimits {
    pub fn short_max(&self) -> usize {
        self.short_max.clamp(20, 240)
    }

    pub fn chunk_turns(&self) -> usize {
        self.chunk_turns.clamp(10, 120)
    }
}

// ─── The unit document ──────────────────────────────────────────────────

/// One durable document per unit: the structured long-term collections,
/// the compacted chunks, and per-unit limits. The rolling short-term
/// window lives beside it in its own append-only line-log. World-scoped
/// units additionally carry flags and discovered locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LongTermRecord {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub unit_key: String,
    #[serde(default)]
    pub facts: Vec<Fact>,
    #[serde(default)]
    pub events: Vec<Event>,
    #[serde(default)]
    pub promises: Vec<Promise>,
    #[serde(default)]
    pub debts: Vec<Debt>,
    #[serde(default)]
    pub relationships: BTreeMap<String, Relationship>,
    #[serde(default)]
    pub summary: Summary,
    #[serde(default)]
    pub chunks: Vec<Chunk>,
    #[serde(default)]
    pub limits: UnitLimits,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub flags: serde_json::Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub discovered_locations: Vec<String>,
}

fn default_schema_version() -> u32 {
    1
}

impl LongTermRecord {
    pub fn empty(unit: &UnitId) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            unit_key: unit.stem(),
            facts: Vec::new(),
            events: Vec::new(),
            promises: Vec::new(),
            debts: Vec::new(),
            relationships: BTreeMap::new(),
            summary: Summary::default(),
            chunks: Vec::new(),
            limits: UnitLimits::default(),
            flags: serde_json::Map::new(),
            discovered_locations: Vec::new(),
        }
    }

    /// Everything the vector index should hold for this unit: chunks first
    /// (the richest artifacts), then the long-term collections.
    pub fn index_sources(&self) -> Vec<IndexSource> {
        let mut out = Vec::new();
        for chunk in &self.chunks {
            if chunk.digest.is_empty() {
                continue;
            }
            out.push(IndexSource {
                source_ref: format!("chunk:{}", chunk.chunk_id),
                kind: "chunk".to_string(),
                text: clean_text(&chunk.digest, 1000),
                tags: chunk.tags.clone(),
                importance: chunk.importance,
                created_at: chunk.last_at,
            });
        }
        for fact in &self.facts {
            out.push(IndexSource {
                source_ref: format!("fact:{}", fact.id),
                kind: "fact".to_string(),
                text: fact.render(),
                tags: fact.tags.clone(),
                importance: fact.importance,
                created_at: fact.created_at,
            });
        }
        for event in &self.events {
            out.push(IndexSource {
                source_ref: format!("event:{}", event.id),
                kind: "event".to_string(),
                text: clean_text(&event.description, 420),
                tags: event.tags.clone(),
                importance: event.importance,
                created_at: event.created_at,
            });
        }
        for promise in &self.promises {
            out.push(IndexSource {
                source_ref: format!("promise:{}", promise.id),
                kind: "promise".to_string(),
                text: clean_text(&promise.description, 420),
                tags: promise.tags.clone(),
                importance: promise.importance,
                created_at: promise.created_at,
            });
        }
        for debt in &self.debts {
            out.push(IndexSource {
                source_ref: format!("debt:{}", debt.id),
                kind: "debt".to_string(),
                text: debt.render(),
                tags: debt.tags.clone(),
                importance: debt.importance,
                created_at: debt.created_at,
            });
        }
        out
    }

    /// True if the given source_ref still resolves to a live record.
    pub fn resolves(&self, source_ref: &str) -> bool {
        match source_ref.split_once(':') {
            Some(("chunk", id)) => self.chunks.iter().any(|c| c.chunk_id == id),
            Some(("fact", id)) => self.facts.iter().any(|f| f.id == id),
            Some(("event", id)) => self.events.iter().any(|e| e.id == id),
            Some(("promise", id)) => self.promises.iter().any(|p| p.id == id),
            Some(("debt", id)) => self.debts.iter().any(|d| d.id == id),
            _ => false,
        }
    }

    pub fn enforce_caps(&mut self) {
        trim_front(&mut self.facts, FACT_CAP);
        trim_front(&mut self.events, EVENT_CAP);
        trim_front(&mut self.promises, PROMISE_CAP);
        trim_front(&mut self.debts, DEBT_CAP);
        trim_front(&mut self.chunks, CHUNK_CAP);
        if self.discovered_locations.len() > 1200 {
            let excess = self.discovered_locations.len() - 1200;
            self.discovered_locations.drain(..excess);
        }
    }
}

fn trim_front<T>(items: &mut Vec<T>, cap: usize) {
    if items.len() > cap {
        let excess = items.len() - cap;
        items.drain(..excess);
    }
}

/// An embeddable record reference produced from a `LongTermRecord`.
#[derive(Debug, Clone)]
pub struct IndexSource {
    pub source_ref: String,
    pub kind: String,
    pub text: String,
    pub tags: Vec<String>,
    pub importance: f32,
    pub created_at: DateTime<Utc>,
}

// ─── Remember payloads ──────────────────────────────────────────────────

/// Structured payloads accepted by `MemoryService::remember`.
#[derive(Debug, Clone)]
pub enum MemoryItem {
    Fact {
        subject: String,
        predicate: String,
        object: String,
        confidence: f32,
    },
    Event {
        description: String,
        participants: Vec<String>,
        impact: Impact,
    },
    Promise {
        description: String,
        due: Option<DateTime<Utc>>,
    },
    Debt {
        kind: String,
        detail: String,
        owed_by: String,
        owed_to: String,
    },
    Relationship {
        target: String,
        delta: i32,
        note: Option<String>,
    },
}

// ─── Schema migration ───────────────────────────────────────────────────

/// Upgrades a raw document to the current schema version, in place.
///
/// v1 → v2: the single player relationship (`player_affinity` plus plain
/// string `player_notes`) becomes the target-keyed `relationships` map, and
/// records missing `importance` pick up the serde defaults on deserialize.
pub fn upgrade_document(mut doc: Value) -> Value {
    let version = doc
        .get("schema_version")
        .and_then(Value::as_u64)
        .unwrap_or(1) as u32;

    if version < 2 {
        if let Some(obj) = doc.as_object_mut() {
            let affinity = obj
                .remove("player_affinity")
                .and_then(|v| v.as_i64())
                .unwrap_or(0)
                .clamp(-100, 100);
            let notes: Vec<Value> = obj
                .remove("player_notes")
                .and_then(|v| v.as_array().cloned())
                .unwrap_or_default()
                .into_iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .map(|text| {
                    serde_json::json!({
                        "text": text,
                        "created_at": now_utc(),
                    })
                })
                .collect();
            if (affinity != 0 || !notes.is_empty()) && !obj.contains_key("relationships") {
                obj.insert(
                    "relationships".to_string(),
                    serde_json::json!({
                        "player": { "disposition": affinity, "notes": notes }
                    }),
                );
            }
        }
    }

    if let Some(obj) = doc.as_object_mut() {
        obj.insert("schema_version".to_string(), Value::from(SCHEMA_VERSION));
    }
    doc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_text_collapses_and_truncates() {
        assert_eq!(clean_text("  a \n  b\t c ", 100), "a b c");
        let long = "x".repeat(50);
        let cut = clean_text(&long, 10);
        assert!(cut.ends_with("..."));
        assert!(cut.chars().count() <= 10);
    }

    #[test]
    fn clean_tag_restricts_charset() {
        assert_eq!(clean_tag("  Old Mill Road! "), "old_mill_road");
        assert_eq!(clean_tag("quest:embers"), "quest:embers");
        assert_eq!(clean_tag("___"), "");
    }

    #[test]
    fn text_hash_ignores_case_and_spacing() {
        assert_eq!(text_hash("The  Dragon"), text_hash("the dragon"));
        assert_ne!(text_hash("dragon"), text_hash("wyvern"));
    }

    #[test]
    fn unit_stem_round_trips() {
        let unit = UnitId::npc("alice", "blacksmith");
        assert_eq!(UnitId::from_stem(&unit.stem()), Some(unit));
        let world = UnitId::world("alice");
        assert_eq!(UnitId::from_stem(&world.stem()), Some(world));
    }

    #[test]
    fn fact_triple_dedup_key_is_normalized() {
        let a = Fact {
            id: new_id(),
            subject: "Player".into(),
            predicate: "owns".into(),
            object: "a  silver ring".into(),
            confidence: 0.9,
            tags: vec![],
            importance: 0.5,
            created_at: now_utc(),
            text_hash: String::new(),
        };
        let mut b = a.clone();
        b.id = new_id();
        b.object = "A Silver Ring".into();
        assert_eq!(a.triple_key(), b.triple_key());
    }

    #[test]
    fn upgrade_v1_moves_player_relationship() {
        let doc = serde_json::json!({
            "schema_version": 1,
            "unit_key": "alice__smith",
            "player_affinity": 12,
            "player_notes": ["trusts the player"],
        });
        let upgraded = upgrade_document(doc);
        assert_eq!(upgraded["schema_version"], SCHEMA_VERSION);
        assert_eq!(upgraded["relationships"]["player"]["disposition"], 12);

        let record: LongTermRecord = serde_json::from_value(upgraded).unwrap();
        assert_eq!(record.relationships["player"].disposition, 12);
        assert_eq!(record.relationships["player"].notes.len(), 1);
    }

    #[test]
    fn record_round_trip_is_lossless() {
        let unit = UnitId::npc("p1", "innkeep");
        let mut record = LongTermRecord::empty(&unit);
        record.facts.push(Fact {
            id: new_id(),
            subject: "innkeep".into(),
            predicate: "is named".into(),
            object: "Marta".into(),
            confidence: 0.8,
            tags: vec!["identity".into()],
            importance: 0.7,
            created_at: now_utc(),
            text_hash: text_hash("innkeep is named Marta"),
        });
        record.promises.push(Promise {
            id: new_id(),
            description: "keep a room free".into(),
            status: PromiseStatus::Open,
            due: Some(now_utc()),
            tags: vec!["promise".into()],
            importance: 0.7,
            created_at: now_utc(),
            text_hash: text_hash("keep a room free"),
        });
        record
            .relationships
            .entry("player".to_string())
            .or_default()
            .adjust(3);

        let json = serde_json::to_string(&record).unwrap();
        let back: LongTermRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.schema_version, SCHEMA_VERSION);
        assert_eq!(back.facts.len(), 1);
        assert_eq!(back.facts[0].object, "Marta");
        assert_eq!(back.promises[0].status, PromiseStatus::Open);
        assert_eq!(back.relationships["player"].disposition, 3);
    }

    #[test]
    fn caps_drop_oldest_first() {
        let unit = UnitId::npc("p1", "smith");
        let mut record = LongTermRecord::empty(&unit);
        for i in 0..(FACT_CAP + 10) {
            record.facts.push(Fact {
                id: format!("f{i}"),
                subject: "npc".into(),
                predicate: "said".into(),
                object: format!("line {i}"),
                confidence: 0.6,
                tags: vec![],
                importance: 0.5,
                created_at: now_utc(),
                text_hash: text_hash(&format!("line {i}")),
            });
        }
        record.enforce_caps();
        assert_eq!(record.facts.len(), FACT_CAP);
        assert_eq!(record.facts[0].id, "f10");
    }
}
