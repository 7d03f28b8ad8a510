// src/bootstrap.rs

//! One-shot ingestion of legacy save-slot conversation history into the
//! structured store. Re-runnable: units that already have a document are
//! detected and skipped, so a second run changes nothing.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, warn};

use crate::compact::compact_record;
use crate::error::Result;
use crate::model::{
    clean_tag, clean_text, now_utc, text_hash, Event, Fact, Impact, LongTermRecord, Promise,
    ShortTermEntry, Speaker, UnitId,
};
use crate::service::MemoryService;

struct PendingUnit {
    record: LongTermRecord,
    short: Vec<ShortTermEntry>,
}

#[derive(Debug, Default, Clone)]
pub struct BootstrapStats {
    pub slots: usize,
    pub units_touched: usize,
    pub units_skipped: usize,
    pub short_added: usize,
    pub long_added: usize,
    pub world_added: usize,
    pub indexes_rebuilt: usize,
}

impl MemoryService {
    /// Scans `saves/profiles/<profile>/slot_*.json` plus legacy root-level
    /// `saves/slot_*.json` (profile "default"), synthesizes memory units
    /// from their conversation state, and rebuilds each touched index.
    pub async fn bootstrap(&self, saves_root: &Path) -> Result<BootstrapStats> {
        let mut stats = BootstrapStats::default();
        let mut pending: HashMap<UnitId, PendingUnit> = HashMap::new();
        let mut skipped: Vec<UnitId> = Vec::new();

        for (profile, state) in discover_slot_states(saves_root) {
            stats.slots += 1;
            self.ingest_slot(&profile, &state, &mut pending, &mut skipped, &mut stats)?;
        }
        stats.units_skipped = skipped.len();

        for (unit, mut pending_unit) in pending {
            let _guard = self.lock_unit(&unit).await?;
            seed_summary(&mut pending_unit.record);
            compact_record(&mut pending_unit.record, &mut pending_unit.short, None).await;
            self.store().save(&unit, &pending_unit.record)?;
            self.store().write_short(&unit, &pending_unit.short)?;
            drop(_guard);
            stats.units_touched += 1;
            self.rebuild_index(&unit).await?;
            stats.indexes_rebuilt += 1;
        }

        info!(
            slots = stats.slots,
            touched = stats.units_touched,
            skipped = stats.units_skipped,
            "bootstrap finished"
        );
        Ok(stats)
    }

    fn ingest_slot(
        &self,
        profile: &str,
        state: &Value,
        pending: &mut HashMap<UnitId, PendingUnit>,
        skipped: &mut Vec<UnitId>,
        stats: &mut BootstrapStats,
    ) -> Result<()> {
        // A unit that already has a document was migrated earlier; leave it.
        let target = |unit: UnitId,
                      pending: &mut HashMap<UnitId, PendingUnit>,
                      skipped: &mut Vec<UnitId>|
         -> Result<Option<UnitId>> {
            if skipped.contains(&unit) {
                return Ok(None);
            }
            if !pending.contains_key(&unit) {
                if self.store().load(&unit)?.is_some() {
                    skipped.push(unit);
                    return Ok(None);
                }
                pending.insert(
                    unit.clone(),
                    PendingUnit {
                        record: LongTermRecord::empty(&unit),
                        short: Vec::new(),
                    },
                );
            }
            Ok(Some(unit))
        };

        if let Some(short) = state.get("conversation_short_term").and_then(Value::as_object) {
            for (npc_key, rows) in short {
                let Some(rows) = rows.as_array() else { continue };
                let Some(unit) = target(UnitId::npc(profile, npc_key), pending, skipped)? else {
                    continue;
                };
                let pending_unit = pending.get_mut(&unit).expect("inserted above");
                for row in rows {
                    if let Some(entry) = short_entry_from_row(row) {
                        pending_unit.short.push(entry);
                        stats.short_added += 1;
                    }
                }
            }
        }

        if let Some(long) = state.get("conversation_long_term").and_then(Value::as_object) {
            for (npc_key, rows) in long {
                let Some(rows) = rows.as_array() else { continue };
                let Some(unit) = target(UnitId::npc(profile, npc_key), pending, skipped)? else {
                    continue;
                };
                let record = &mut pending.get_mut(&unit).expect("inserted above").record;
                for row in rows {
                    if ingest_long_row(record, row) {
                        stats.long_added += 1;
                    }
                }
            }
        }

        if let Some(rows) = state
            .get("conversation_global_long_term")
            .and_then(Value::as_array)
        {
            if let Some(unit) = target(UnitId::world(profile), pending, skipped)? {
                let record = &mut pending.get_mut(&unit).expect("inserted above").record;
                for row in rows {
                    let Some(text) = row_summary(row) else { continue };
                    let hash = text_hash(&text);
                    if record.events.iter().any(|e| e.text_hash == hash) {
                        continue;
                    }
                    record.events.push(Event {
                        id: crate::model::new_id(),
                        description: text,
                        participants: Vec::new(),
                        impact: Impact::Med,
                        tags: row_tags(row),
                        importance: 0.55,
                        created_at: row_timestamp(row),
                        text_hash: hash,
                    });
                    stats.world_added += 1;
                }
            }
        }

        Ok(())
    }
}

/// Every `(profile, state)` pair found under the saves root.
fn discover_slot_states(saves_root: &Path) -> Vec<(String, Value)> {
    let mut out = Vec::new();
    let profiles_root = saves_root.join("profiles");
    if profiles_root.is_dir() {
        for profile_dir in sorted_dirs(&profiles_root) {
            let profile = profile_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "default".to_string());
            for slot in sorted_slots(&profile_dir) {
                if let Some(state) = read_slot_state(&slot) {
                    out.push((profile.clone(), state));
                }
            }
        }
    }
    for slot in sorted_slots(saves_root) {
        if let Some(state) = read_slot_state(&slot) {
            out.push(("default".to_string(), state));
        }
    }
    out
}

fn sorted_dirs(root: &Path) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(root)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect()
        })
        .unwrap_or_default();
    dirs.sort();
    dirs
}

fn sorted_slots(root: &Path) -> Vec<PathBuf> {
    let mut slots: Vec<PathBuf> = fs::read_dir(root)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| {
                    p.is_file()
                        && p.file_name()
                            .map(|n| {
                                let name = n.to_string_lossy();
                                name.starts_with("slot_") && name.ends_with(".json")
                            })
                            .unwrap_or(false)
                })
                .collect()
        })
        .unwrap_or_default();
    slots.sort();
    slots
}

fn read_slot_state(path: &Path) -> Option<Value> {
    let raw = fs::read_to_string(path).ok()?;
    let payload: Value = match serde_json::from_str(&raw) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(path = %path.display(), %err, "skipping unreadable save slot");
            return None;
        }
    };
    let state = payload.get("state")?;
    state.is_object().then(|| state.clone())
}

fn row_timestamp(row: &Value) -> DateTime<Utc> {
    ["at", "ts"]
        .iter()
        .filter_map(|key| row.get(*key))
        .filter_map(Value::as_str)
        .filter_map(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .next()
        .unwrap_or_else(now_utc)
}

fn row_tags(row: &Value) -> Vec<String> {
    let mut tags = Vec::new();
    for key in ["kind", "role", "scene_title"] {
        if let Some(raw) = row.get(key).and_then(Value::as_str) {
            let tag = clean_tag(raw);
            if !tag.is_empty() && !tags.contains(&tag) {
                tags.push(tag);
            }
        }
    }
    tags.truncate(12);
    tags
}

fn row_summary(row: &Value) -> Option<String> {
    let text = clean_text(row.get("summary")?.as_str()?, 420);
    (!text.is_empty()).then_some(text)
}

fn short_entry_from_row(row: &Value) -> Option<ShortTermEntry> {
    let text = clean_text(row.get("text")?.as_str()?, 460);
    if text.is_empty() {
        return None;
    }
    let speaker = match row.get("role").and_then(Value::as_str).unwrap_or("npc") {
        "player" => Speaker::Player,
        "system" => Speaker::System,
        "narration" => Speaker::Narration,
        _ => Speaker::Npc,
    };
    let turn_id = row
        .get("turn_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| text_hash(&text)[..32].to_string());
    Some(ShortTermEntry {
        turn_id,
        speaker,
        tags: row_tags(row),
        importance: 0.45,
        created_at: row_timestamp(row),
        text,
    })
}

/// Routes one kind-tagged legacy summary row into the matching collection.
fn ingest_long_row(record: &mut LongTermRecord, row: &Value) -> bool {
    let Some(text) = row_summary(row) else {
        return false;
    };
    let hash = text_hash(&text);
    let created_at = row_timestamp(row);
    let tags = row_tags(row);
    let kind = row
        .get("kind")
        .and_then(Value::as_str)
        .unwrap_or("general")
        .to_lowercase();

    match kind.as_str() {
        "promise" => {
            if record.promises.iter().any(|p| p.text_hash == hash) {
                return false;
            }
            record.promises.push(Promise {
                id: crate::model::new_id(),
                description: text,
                status: Default::default(),
                due: None,
                tags,
                importance: 0.7,
                created_at,
                text_hash: hash,
            });
        }
        "debt" => {
            if record.debts.iter().any(|d| d.text_hash == hash) {
                return false;
            }
            record.debts.push(crate::model::Debt {
                id: crate::model::new_id(),
                kind: "favor".to_string(),
                detail: text,
                owed_by: "npc".to_string(),
                owed_to: "player".to_string(),
                status: Default::default(),
                tags,
                importance: 0.7,
                created_at,
                text_hash: hash,
            });
        }
        "event" | "quest" | "combat" | "trade" | "travel" | "training" => {
            if record.events.iter().any(|e| e.text_hash == hash) {
                return false;
            }
            let impact = if matches!(kind.as_str(), "quest" | "combat" | "event") {
                Impact::Med
            } else {
                Impact::Low
            };
            record.events.push(Event {
                id: crate::model::new_id(),
                description: text,
                participants: Vec::new(),
                impact,
                tags,
                importance: 0.62,
                created_at,
                text_hash: hash,
            });
        }
        _ => {
            let fact = Fact {
                id: crate::model::new_id(),
                subject: "npc".to_string(),
                predicate: "recalls".to_string(),
                object: text,
                confidence: 0.65,
                tags,
                importance: 0.52,
                created_at,
                text_hash: hash,
            };
            let key = fact.triple_key();
            if record.facts.iter().any(|f| f.triple_key() == key) {
                return false;
            }
            record.facts.push(fact);
        }
    }
    true
}

/// Gives a freshly migrated record a starting synopsis from its newest
/// events and facts, when nothing better exists yet.
fn seed_summary(record: &mut LongTermRecord) {
    if !record.summary.text.is_empty() {
        return;
    }
    let mut pieces: Vec<String> = Vec::new();
    pieces.extend(record.events.iter().rev().take(3).map(|e| e.description.clone()));
    pieces.extend(record.facts.iter().rev().take(3).map(|f| f.render()));
    let seed = clean_text(&pieces.join(" "), 900);
    if !seed.is_empty() {
        record.summary.text = seed;
        record.summary.updated_at = now_utc();
    }
}
