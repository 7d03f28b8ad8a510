// src/retrieval.rs

//! Hybrid retrieval scoring: vector similarity blended with tag overlap,
//! recency, and stored importance. The weights are a contract — identical
//! inputs must reproduce identical rankings.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::index::IndexRecord;
use crate::model::{clean_text, LongTermRecord};

pub const W_SIMILARITY: f32 = 0.6;
pub const W_TAG_OVERLAP: f32 = 0.2;
pub const W_RECENCY: f32 = 0.1;
pub const W_IMPORTANCE: f32 = 0.1;

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[a-z0-9_:-]{3,}").unwrap());

/// One ranked retrieval result.
#[derive(Debug, Clone)]
pub struct MemoryFragment {
    pub source_ref: String,
    pub kind: String,
    pub text: String,
    pub tags: Vec<String>,
    pub importance: f32,
    pub created_at: DateTime<Utc>,
    pub score: f32,
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub source_ref: String,
    pub kind: String,
    pub text: String,
    pub tags: Vec<String>,
    pub importance: f32,
    pub created_at: DateTime<Utc>,
    /// Already mapped into [0,1]; zero in degraded mode.
    pub vector_sim: f32,
}

pub fn tokenize(text: &str) -> BTreeSet<String> {
    TOKEN_RE
        .find_iter(&text.to_lowercase())
        .map(|m| m.as_str().to_string())
        .collect()
}

pub fn overlap_ratio(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    if intersection == 0 {
        return 0.0;
    }
    intersection as f32 / a.union(b).count() as f32
}

/// Exponential recency decay, bounded to [0,1]. `tau_hours` is the
/// configured time constant (`MemoryConfig::recency_tau_hours`).
pub fn recency_decay(created_at: DateTime<Utc>, now: DateTime<Utc>, tau_hours: f32) -> f32 {
    let age_hours = (now - created_at).num_seconds().max(0) as f32 / 3600.0;
    (-age_hours / tau_hours).exp().clamp(0.0, 1.0)
}

/// The scoring contract:
/// `0.6 * similarity + 0.2 * tag_overlap + 0.1 * recency + 0.1 * importance`.
pub fn score(
    candidate: &Candidate,
    query_tokens: &BTreeSet<String>,
    now: DateTime<Utc>,
    tau_hours: f32,
) -> f32 {
    let tags: BTreeSet<String> = candidate.tags.iter().map(|t| t.to_lowercase()).collect();
    let tag_overlap = overlap_ratio(&tags, query_tokens);
    let recency = recency_decay(candidate.created_at, now, tau_hours);
    let importance = candidate.importance.clamp(0.0, 1.0);
    let similarity = candidate.vector_sim.clamp(0.0, 1.0);
    W_SIMILARITY * similarity
        + W_TAG_OVERLAP * tag_overlap
        + W_RECENCY * recency
        + W_IMPORTANCE * importance
}

/// Scores, sorts descending, breaks ties by recency then insertion order
/// (the sort is stable), and returns the top `k` fragments.
pub fn rank(
    candidates: Vec<Candidate>,
    query_tokens: &BTreeSet<String>,
    now: DateTime<Utc>,
    tau_hours: f32,
    k: usize,
) -> Vec<MemoryFragment> {
    let mut scored: Vec<(f32, Candidate)> = candidates
        .into_iter()
        .map(|c| (score(&c, query_tokens, now, tau_hours), c))
        .collect();
    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.1.created_at.cmp(&a.1.created_at))
    });
    scored
        .into_iter()
        .take(k)
        .map(|(score, c)| MemoryFragment {
            source_ref: c.source_ref,
            kind: c.kind,
            text: c.text,
            tags: c.tags,
            importance: c.importance,
            created_at: c.created_at,
            score,
        })
        .collect()
}

/// Candidate from an index hit; raw cosine is mapped into [0,1].
pub fn candidate_from_hit(record: &IndexRecord, similarity: f32) -> Candidate {
    Candidate {
        source_ref: record.source_ref.clone(),
        kind: record.kind.clone(),
        text: clean_text(&record.text, 220),
        tags: record.tags.clone(),
        importance: record.importance,
        created_at: record.created_at,
        vector_sim: ((similarity + 1.0) / 2.0).clamp(0.0, 1.0),
    }
}

/// Degraded-mode candidates: every record whose tags or text tokens overlap
/// the query (all records when the query is empty), with the vector term
/// zeroed so ranking falls to tags, recency, and importance.
pub fn degraded_candidates(
    record: &LongTermRecord,
    query_tokens: &BTreeSet<String>,
) -> Vec<Candidate> {
    record
        .index_sources()
        .into_iter()
        .filter_map(|source| {
            if !query_tokens.is_empty() {
                let mut haystack = tokenize(&source.text);
                haystack.extend(source.tags.iter().map(|t| t.to_lowercase()));
                if overlap_ratio(query_tokens, &haystack) <= 0.0 {
                    return None;
                }
            }
            Some(Candidate {
                source_ref: source.source_ref,
                kind: source.kind,
                text: clean_text(&source.text, 220),
                tags: source.tags,
                importance: source.importance,
                created_at: source.created_at,
                vector_sim: 0.0,
            })
        })
        .collect()
}

/// Keeps candidates carrying at least one of the requested tags.
pub fn apply_tag_filter(candidates: Vec<Candidate>, filter: &[String]) -> Vec<Candidate> {
    if filter.is_empty() {
        return candidates;
    }
    let wanted: BTreeSet<String> = filter.iter().map(|t| t.to_lowercase()).collect();
    candidates
        .into_iter()
        .filter(|c| c.tags.iter().any(|t| wanted.contains(&t.to_lowercase())))
        .collect()
}

/// Prompt-assembly view over one unit's memory.
#[derive(Debug, Clone, Default)]
pub struct RetrievedContext {
    pub short_lines: Vec<String>,
    pub long_lines: Vec<String>,
    pub retrieved_lines: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::now_utc;
    use chrono::Duration;

    fn candidate(text: &str, importance: f32, sim: f32, at: DateTime<Utc>) -> Candidate {
        Candidate {
            source_ref: format!("fact:{text}"),
            kind: "fact".to_string(),
            text: text.to_string(),
            tags: vec!["quest".to_string()],
            importance,
            created_at: at,
            vector_sim: sim,
        }
    }

    #[test]
    fn score_reproduces_the_contract() {
        let now = now_utc();
        let c = candidate("a", 1.0, 1.0, now);
        let query: BTreeSet<String> = ["quest".to_string()].into_iter().collect();
        // similarity 1, tag overlap 1, recency 1, importance 1 → weights sum.
        let s = score(&c, &query, now, 240.0);
        assert!((s - 1.0).abs() < 1e-6);

        let zero = candidate("b", 0.0, 0.0, now - Duration::days(3650));
        let empty = BTreeSet::new();
        assert!(score(&zero, &empty, now, 240.0) < 1e-3);
    }

    #[test]
    fn recency_decay_is_monotonic() {
        let now = now_utc();
        let fresh = recency_decay(now, now, 240.0);
        let old = recency_decay(now - Duration::hours(240), now, 240.0);
        let older = recency_decay(now - Duration::hours(480), now, 240.0);
        assert!(fresh > old && old > older);
        assert!((fresh - 1.0).abs() < 1e-6);
    }

    #[test]
    fn higher_importance_never_ranks_lower() {
        let now = now_utc();
        let query = BTreeSet::new();
        for boost in [0.1_f32, 0.4, 0.9] {
            let low = candidate("low", 0.1, 0.5, now);
            let high = candidate("high", 0.1 + boost, 0.5, now);
            let ranked = rank(vec![low, high], &query, now, 240.0, 2);
            assert_eq!(ranked[0].text, "high");
        }
    }

    #[test]
    fn ties_break_by_recency_then_insertion_order() {
        let now = now_utc();
        let query = BTreeSet::new();
        // Both ages clamp to zero, so the scores are bit-identical and only
        // the recency tie-break separates them.
        let older = candidate("older", 0.5, 0.5, now - Duration::seconds(0));
        let newer = candidate("newer", 0.5, 0.5, now + Duration::hours(1));
        let ranked = rank(vec![older, newer], &query, now, 240.0, 2);
        assert_eq!(ranked[0].text, "newer");

        let first = candidate("first", 0.5, 0.5, now);
        let second = candidate("second", 0.5, 0.5, now);
        let ranked = rank(vec![first, second], &query, now, 240.0, 2);
        assert_eq!(ranked[0].text, "first");
    }

    #[test]
    fn tag_filter_keeps_only_matching() {
        let now = now_utc();
        let mut a = candidate("a", 0.5, 0.5, now);
        a.tags = vec!["combat".to_string()];
        let b = candidate("b", 0.5, 0.5, now);
        let filtered = apply_tag_filter(vec![a, b], &["combat".to_string()]);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].text, "a");
    }
}
