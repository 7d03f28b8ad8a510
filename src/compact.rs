// src/compact.rs

//! Converts overflowing short-term entries into long-term structure. Patch
//! candidates come from an injected generative planner when the host
//! supplies one, otherwise from the always-available rule-based extractor.
//! Application is deduplicating and cap-enforcing; the summary is replaced
//! wholesale each pass, never appended.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::model::{
    clean_tag, clean_tags, clean_text, new_id, now_utc, text_hash, Chunk, Debt, DebtStatus,
    Event, Fact, Impact, LongTermRecord, Promise, PromiseStatus, ShortTermEntry, Speaker,
    Summary,
};

static PROMISE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(i promise|i will|i swear|i shall|you have my word)\b").unwrap()
});
static DEBT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(i owe|owes? (?:me|you)|pay (?:you|me) back|debt|repay)\b").unwrap()
});
static EVENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(quest|fight|fought|battle|attack|ambush|victory|defeat|found|lost|discover)\b")
        .unwrap()
});
static HIGH_IMPACT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(death|died|defeat|boss|betray|ruin)\b").unwrap());
static MED_IMPACT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(fight|quest|victory|attack|battle)\b").unwrap());

/// First-person fact cues and the predicate each one maps to.
const FACT_CUES: &[(&str, &str)] = &[
    ("my name is", "is named"),
    ("i am called", "is named"),
    ("i live in", "lives in"),
    ("i come from", "comes from"),
    ("i own", "owns"),
    ("i have", "has"),
    ("i am", "is"),
];

const POSITIVE_CUES: &[&str] = &["thank", "great", "perfect", "wonderful", "agreed", "yes"];
const NEGATIVE_CUES: &[&str] = &["never", "hate", "liar", "angry", "useless", "no"];

/// Keyword → tag rules shared by the appenders and the extractor.
pub fn keyword_tags(text: &str) -> Vec<String> {
    const RULES: &[(&str, &[&str])] = &[
        ("trade", &["buy", "sell", "price", "gold", "trade", "merchant"]),
        ("quest", &["quest", "mission", "objective", "contract"]),
        ("combat", &["fight", "attack", "monster", "dungeon", "battle"]),
        ("training", &["train", "skill", "spell", "learn", "level"]),
        ("travel", &["road", "travel", "town", "journey"]),
        ("promise", &["promise", "i will", "i swear"]),
        ("debt", &["debt", "owe", "repay", "pay back"]),
        ("relationship", &["trust", "betray", "love", "hate", "respect"]),
    ];
    let haystack = text.to_lowercase();
    RULES
        .iter()
        .filter(|(_, words)| words.iter().any(|w| haystack.contains(w)))
        .map(|(tag, _)| tag.to_string())
        .collect()
}

// ─── Patch model ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct FactDraft {
    pub subject: String,
    pub predicate: String,
    pub object: String,
    pub confidence: f32,
    pub tags: Vec<String>,
    pub importance: f32,
}

#[derive(Debug, Clone)]
pub struct EventDraft {
    pub description: String,
    pub impact: Impact,
    pub tags: Vec<String>,
    pub importance: f32,
}

#[derive(Debug, Clone)]
pub struct PromiseDraft {
    pub description: String,
    pub tags: Vec<String>,
    pub importance: f32,
}

#[derive(Debug, Clone)]
pub struct DebtDraft {
    pub kind: String,
    pub detail: String,
    pub owed_by: String,
    pub owed_to: String,
    pub tags: Vec<String>,
    pub importance: f32,
}

#[derive(Debug, Clone, Default)]
pub struct RelationshipDelta {
    pub target: String,
    pub delta: i32,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CompactionPatch {
    pub digest: String,
    pub tags: Vec<String>,
    pub importance: f32,
    pub facts: Vec<FactDraft>,
    pub events: Vec<EventDraft>,
    pub promises: Vec<PromiseDraft>,
    pub debts: Vec<DebtDraft>,
    pub relationship: RelationshipDelta,
    pub summary: String,
}

/// Generative assistance supplied by the host — an injected capability, not
/// an internal dependency. Returning `None` falls back to the rule-based
/// extractor.
#[async_trait]
pub trait CompactionPlanner: Send + Sync {
    async fn plan(&self, turns: &[ShortTermEntry]) -> Option<CompactionPatch>;
}

#[derive(Debug, Default)]
pub struct CompactionOutcome {
    pub applied: bool,
    pub chunks_compacted: usize,
    /// Chunks appended this run, for incremental indexing.
    pub new_chunks: Vec<Chunk>,
    pub patch_summary: String,
}

// ─── Rule-based extractor ───────────────────────────────────────────────

fn other_party(speaker: Speaker) -> &'static str {
    match speaker {
        Speaker::Player => "npc",
        _ => "player",
    }
}

fn derive_fact(speaker: Speaker, text: &str) -> Option<FactDraft> {
    let haystack = text.to_lowercase();
    for (cue, predicate) in FACT_CUES {
        if let Some(pos) = haystack.find(cue) {
            let object = clean_text(&text[pos + cue.len()..], 180);
            if object.is_empty() {
                continue;
            }
            return Some(FactDraft {
                subject: speaker.as_tag().to_string(),
                predicate: predicate.to_string(),
                object,
                confidence: 0.62,
                tags: keyword_tags(text),
                importance: 0.5,
            });
        }
    }
    None
}

/// Always-available heuristic extraction over one batch of turns.
pub fn extract_patch(turns: &[ShortTermEntry]) -> CompactionPatch {
    let mut lines = Vec::new();
    let mut tags: Vec<String> = Vec::new();
    let mut spoken: Vec<(Speaker, String)> = Vec::new();
    let mut player_lines = Vec::new();

    for turn in turns {
        let text = clean_text(&turn.text, 260);
        if text.is_empty() {
            continue;
        }
        lines.push(format!("{}: {}", turn.speaker.as_tag().to_uppercase(), text));
        if turn.speaker == Speaker::Player {
            player_lines.push(text.clone());
        }
        for tag in keyword_tags(&text) {
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }
        spoken.push((turn.speaker, text));
    }

    if lines.is_empty() {
        return CompactionPatch {
            digest: "(no content)".to_string(),
            summary: "(no summary)".to_string(),
            ..Default::default()
        };
    }

    let head = &lines[..lines.len().min(2)];
    let tail = if lines.len() > 3 { &lines[lines.len() - 3..] } else { &lines[0..0] };
    let digest = clean_text(&[head, tail].concat().join(" | "), 600);

    let mut importance: f32 = 0.35;
    if tags.iter().any(|t| matches!(t.as_str(), "promise" | "debt" | "quest")) {
        importance += 0.22;
    }
    if tags.iter().any(|t| matches!(t.as_str(), "combat" | "relationship")) {
        importance += 0.12;
    }
    if spoken.len() >= 24 {
        importance += 0.10;
    }
    let importance = importance.clamp(0.15, 1.0);

    let mut facts = Vec::new();
    let mut events = Vec::new();
    let mut promises = Vec::new();
    let mut debts = Vec::new();

    let recent = &spoken[spoken.len().saturating_sub(24)..];
    for (speaker, text) in recent {
        let local_tags = keyword_tags(text);
        if PROMISE_RE.is_match(text) {
            promises.push(PromiseDraft {
                description: text.clone(),
                tags: if local_tags.is_empty() { vec!["promise".into()] } else { local_tags.clone() },
                importance: 0.72,
            });
        }
        if DEBT_RE.is_match(text) {
            debts.push(DebtDraft {
                kind: "favor".to_string(),
                detail: text.clone(),
                owed_by: speaker.as_tag().to_string(),
                owed_to: other_party(*speaker).to_string(),
                tags: if local_tags.is_empty() { vec!["debt".into()] } else { local_tags.clone() },
                importance: 0.72,
            });
        }
        if EVENT_RE.is_match(text) || *speaker == Speaker::System {
            let impact = if HIGH_IMPACT_RE.is_match(text) {
                Impact::High
            } else if MED_IMPACT_RE.is_match(text) {
                Impact::Med
            } else {
                Impact::Low
            };
            events.push(EventDraft {
                description: text.clone(),
                impact,
                tags: if local_tags.is_empty() { vec!["event".into()] } else { local_tags.clone() },
                importance: if impact == Impact::High { 0.62 } else { 0.54 },
            });
        }
        if let Some(fact) = derive_fact(*speaker, text) {
            facts.push(fact);
        }
    }

    if facts.is_empty() {
        facts.push(FactDraft {
            subject: "conversation".to_string(),
            predicate: "covered".to_string(),
            object: clean_text(&digest, 360),
            confidence: 0.55,
            tags: tags.iter().take(4).cloned().collect(),
            importance: 0.45,
        });
    }

    let positive = player_lines
        .iter()
        .filter(|t| {
            let lower = t.to_lowercase();
            POSITIVE_CUES.iter().any(|cue| lower.contains(cue))
        })
        .count() as i32;
    let negative = player_lines
        .iter()
        .filter(|t| {
            let lower = t.to_lowercase();
            NEGATIVE_CUES.iter().any(|cue| lower.contains(cue))
        })
        .count() as i32;
    let delta = (positive - negative).clamp(-5, 5);

    let mut notes = Vec::new();
    if delta > 0 {
        notes.push("The player shows more trust and openness.".to_string());
    } else if delta < 0 {
        notes.push("The player shows tension or distrust.".to_string());
    } else if tags.iter().any(|t| t == "relationship") {
        notes.push("The relationship stays active without a clear shift.".to_string());
    }

    facts.truncate(10);
    events.truncate(10);
    promises.truncate(10);
    debts.truncate(10);
    tags.truncate(8);

    CompactionPatch {
        summary: clean_text(&format!("Highlights: {digest}"), 760),
        digest,
        tags: if tags.is_empty() { vec!["general".into()] } else { tags },
        importance,
        facts,
        events,
        promises,
        debts,
        relationship: RelationshipDelta {
            target: "player".to_string(),
            delta,
            notes,
        },
    }
}

// ─── Patch application ──────────────────────────────────────────────────

fn chunk_from_patch(turns: &[ShortTermEntry], patch: &CompactionPatch) -> Chunk {
    let now = now_utc();
    let first_at = turns.first().map(|t| t.created_at).unwrap_or(now);
    let last_at = turns.last().map(|t| t.created_at).unwrap_or(now);
    let digest = clean_text(&patch.digest, 1000);
    Chunk {
        chunk_id: new_id(),
        first_at,
        last_at,
        turn_ids: turns.iter().map(|t| t.turn_id.clone()).collect(),
        text_hash: text_hash(&digest),
        digest,
        tags: clean_tags(&patch.tags),
        importance: patch.importance.clamp(0.0, 1.0),
    }
}

/// Folds a patch into the long-term collections. New facts dedup against
/// existing (subject, predicate, object) triples; the other collections
/// dedup on text hash; the summary is replaced wholesale.
pub fn apply_patch(record: &mut LongTermRecord, patch: &CompactionPatch) -> Vec<&'static str> {
    let now = now_utc();
    let mut notes = Vec::new();

    for draft in &patch.facts {
        let fact = Fact {
            id: new_id(),
            subject: clean_text(&draft.subject, 120),
            predicate: clean_text(&draft.predicate, 120),
            object: clean_text(&draft.object, 420),
            confidence: draft.confidence.clamp(0.0, 1.0),
            tags: clean_tags(&draft.tags),
            importance: draft.importance.clamp(0.0, 1.0),
            created_at: now,
            text_hash: String::new(),
        };
        if fact.object.is_empty() {
            continue;
        }
        let fact = Fact {
            text_hash: text_hash(&fact.render()),
            ..fact
        };
        let key = fact.triple_key();
        if record.facts.iter().all(|f| f.triple_key() != key) {
            record.facts.push(fact);
            notes.push("fact+");
        }
    }

    for draft in &patch.events {
        let description = clean_text(&draft.description, 420);
        if description.is_empty() {
            continue;
        }
        let hash = text_hash(&description);
        if record.events.iter().all(|e| e.text_hash != hash) {
            record.events.push(Event {
                id: new_id(),
                description,
                participants: Vec::new(),
                impact: draft.impact,
                tags: clean_tags(&draft.tags),
                importance: draft.importance.clamp(0.0, 1.0),
                created_at: now,
                text_hash: hash,
            });
            notes.push("event+");
        }
    }

    for draft in &patch.promises {
        let description = clean_text(&draft.description, 420);
        if description.is_empty() {
            continue;
        }
        let hash = text_hash(&description);
        if record.promises.iter().all(|p| p.text_hash != hash) {
            record.promises.push(Promise {
                id: new_id(),
                description,
                status: PromiseStatus::Open,
                due: None,
                tags: clean_tags(&draft.tags),
                importance: draft.importance.clamp(0.0, 1.0),
                created_at: now,
                text_hash: hash,
            });
            notes.push("promise+");
        }
    }

    for draft in &patch.debts {
        let detail = clean_text(&draft.detail, 420);
        if detail.is_empty() {
            continue;
        }
        let hash = text_hash(&detail);
        if record.debts.iter().all(|d| d.text_hash != hash) {
            record.debts.push(Debt {
                id: new_id(),
                kind: clean_text(&draft.kind, 60),
                detail,
                owed_by: clean_text(&draft.owed_by, 120),
                owed_to: clean_text(&draft.owed_to, 120),
                status: DebtStatus::Open,
                tags: clean_tags(&draft.tags),
                importance: draft.importance.clamp(0.0, 1.0),
                created_at: now,
                text_hash: hash,
            });
            notes.push("debt+");
        }
    }

    if patch.relationship.delta != 0 || !patch.relationship.notes.is_empty() {
        let target = clean_tag(&patch.relationship.target);
        if !target.is_empty() {
            let relationship = record.relationships.entry(target).or_default();
            relationship.adjust(patch.relationship.delta);
            for note in patch.relationship.notes.iter().take(4) {
                relationship.add_note(note, now);
            }
        }
    }

    let summary = clean_text(&patch.summary, 1200);
    if !summary.is_empty() {
        record.summary = Summary {
            text: summary,
            updated_at: now,
        };
        notes.push("summary~");
    }

    record.enforce_caps();
    notes
}

// ─── The compaction loop ────────────────────────────────────────────────

/// Compacts in memory until the short-term window fits its capacity. Each
/// pass folds the oldest overflow (at most `chunk_turns` entries) into one
/// chunk and evicts the consumed entries from `short`. Persistence is the
/// caller's job; because every application deduplicates, replaying a pass
/// whose persistence half-failed converges instead of duplicating.
pub async fn compact_record(
    record: &mut LongTermRecord,
    short: &mut Vec<ShortTermEntry>,
    planner: Option<&dyn CompactionPlanner>,
) -> CompactionOutcome {
    let mut outcome = CompactionOutcome::default();
    let short_max = record.limits.short_max();
    let chunk_turns = record.limits.chunk_turns();

    while short.len() > short_max {
        let overflow = short.len() - short_max;
        let take = overflow.min(chunk_turns);
        let batch: Vec<ShortTermEntry> = short[..take].to_vec();

        let patch = match planner {
            Some(planner) => match planner.plan(&batch).await {
                Some(patch) if !patch.digest.is_empty() => {
                    debug!("compaction patch from planner");
                    patch
                }
                _ => extract_patch(&batch),
            },
            None => extract_patch(&batch),
        };

        let chunk = chunk_from_patch(&batch, &patch);
        if !chunk.digest.is_empty()
            && record.chunks.iter().all(|c| c.text_hash != chunk.text_hash)
        {
            record.chunks.push(chunk.clone());
            outcome.new_chunks.push(chunk);
        }
        apply_patch(record, &patch);

        short.drain(..take);
        record.limits.last_compacted_at = Some(now_utc());
        outcome.chunks_compacted += 1;
        outcome.applied = true;
        outcome.patch_summary = patch.summary.clone();
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(speaker: Speaker, text: &str) -> ShortTermEntry {
        ShortTermEntry::new(speaker, text)
    }

    #[test]
    fn extractor_finds_promises_debts_and_facts() {
        let turns = vec![
            turn(Speaker::Player, "I promise to return before the festival"),
            turn(Speaker::Npc, "My name is Marta, I keep the inn"),
            turn(Speaker::Npc, "You owe me three gold for the room"),
            turn(Speaker::System, "The quest at the old mill was completed"),
        ];
        let patch = extract_patch(&turns);
        assert!(!patch.promises.is_empty());
        assert!(!patch.debts.is_empty());
        assert!(patch.facts.iter().any(|f| f.predicate == "is named"));
        assert!(!patch.events.is_empty());
        assert!(!patch.digest.is_empty());
        assert!(patch.tags.iter().any(|t| t == "quest"));
    }

    #[test]
    fn apply_patch_dedups_fact_triples() {
        let unit = crate::model::UnitId::npc("p", "innkeep");
        let mut record = LongTermRecord::empty(&unit);
        let patch = CompactionPatch {
            digest: "a chat".into(),
            facts: vec![FactDraft {
                subject: "npc".into(),
                predicate: "is named".into(),
                object: "Marta".into(),
                confidence: 0.7,
                tags: vec![],
                importance: 0.6,
            }],
            summary: "summary".into(),
            ..Default::default()
        };
        apply_patch(&mut record, &patch);
        apply_patch(&mut record, &patch);
        assert_eq!(record.facts.len(), 1);
        assert_eq!(record.summary.text, "summary");
    }

    #[tokio::test]
    async fn overflow_of_one_compacts_once_and_leaves_capacity() {
        let unit = crate::model::UnitId::npc("p", "smith");
        let mut record = LongTermRecord::empty(&unit);
        record.limits.short_max = 20;
        record.limits.chunk_turns = 10;
        let mut short: Vec<ShortTermEntry> = (0..21)
            .map(|i| turn(Speaker::Player, &format!("line {i} about the quest")))
            .collect();
        let outcome = compact_record(&mut record, &mut short, None).await;
        assert!(outcome.applied);
        assert_eq!(outcome.chunks_compacted, 1);
        assert_eq!(short.len(), 20);
        assert_eq!(short[0].text, "line 1 about the quest");
        assert_eq!(record.chunks.len(), 1);
        assert!(record.limits.last_compacted_at.is_some());
    }

    #[tokio::test]
    async fn bulk_overflow_compacts_in_chunk_batches() {
        let unit = crate::model::UnitId::npc("p", "smith");
        let mut record = LongTermRecord::empty(&unit);
        record.limits.short_max = 20;
        record.limits.chunk_turns = 10;
        let mut short: Vec<ShortTermEntry> = (0..55)
            .map(|i| {
                turn(
                    if i % 2 == 0 { Speaker::Player } else { Speaker::Npc },
                    &format!("turn {i} i promise to train harder"),
                )
            })
            .collect();
        let outcome = compact_record(&mut record, &mut short, None).await;
        // 35 overflow → batches of 10, 10, 10, 5.
        assert_eq!(outcome.chunks_compacted, 4);
        assert_eq!(short.len(), 20);
        assert!(!record.promises.is_empty());
    }

    #[tokio::test]
    async fn planner_output_wins_over_extractor() {
        struct FixedPlanner;

        #[async_trait]
        impl CompactionPlanner for FixedPlanner {
            async fn plan(&self, _turns: &[ShortTermEntry]) -> Option<CompactionPatch> {
                Some(CompactionPatch {
                    digest: "planned digest".into(),
                    summary: "planned summary".into(),
                    importance: 0.9,
                    ..Default::default()
                })
            }
        }

        let unit = crate::model::UnitId::npc("p", "smith");
        let mut record = LongTermRecord::empty(&unit);
        record.limits.short_max = 20;
        record.limits.chunk_turns = 10;
        let mut short: Vec<ShortTermEntry> =
            (0..25).map(|i| turn(Speaker::Npc, &format!("line {i}"))).collect();
        let outcome = compact_record(&mut record, &mut short, Some(&FixedPlanner)).await;
        assert!(outcome.applied);
        assert_eq!(record.summary.text, "planned summary");
        assert_eq!(record.chunks[0].digest, "planned digest");
    }
}
