// src/store.rs

//! Durable per-unit storage: one JSON document per unit, JSONL line-logs for
//! index mappings and the shared embedding cache, and an opaque vector blob
//! per unit.
//!
//! Whole-document writes go through a temp file + rename so a crash mid-write
//! never corrupts the previous valid version. A truncated trailing JSONL line
//! is discarded on read rather than treated as corruption.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{MemoryError, Result};
use crate::index::IndexRecord;
use crate::model::{upgrade_document, LongTermRecord, ShortTermEntry, UnitId};

pub struct DurableStore {
    memory_root: PathBuf,
    index_root: PathBuf,
}

impl DurableStore {
    pub fn new(data_root: &Path) -> Result<Self> {
        let store = Self {
            memory_root: data_root.join("memory"),
            index_root: data_root.join("index"),
        };
        fs::create_dir_all(&store.memory_root)?;
        fs::create_dir_all(&store.index_root)?;
        Ok(store)
    }

    pub fn document_path(&self, unit: &UnitId) -> PathBuf {
        self.memory_root.join(format!("{}.json", unit.stem()))
    }

    pub fn short_path(&self, unit: &UnitId) -> PathBuf {
        self.memory_root.join(format!("{}.short.jsonl", unit.stem()))
    }

    pub fn mapping_path(&self, unit: &UnitId) -> PathBuf {
        self.index_root.join(format!("{}.jsonl", unit.stem()))
    }

    pub fn vectors_path(&self, unit: &UnitId) -> PathBuf {
        self.index_root.join(format!("{}.vec", unit.stem()))
    }

    pub fn cache_path(&self) -> PathBuf {
        self.index_root.join("emb_cache.jsonl")
    }

    // ── Documents ───────────────────────────────────────────────────────

    /// Loads a unit's document. `None` if the unit has never been written;
    /// `CorruptState` if the file exists but does not parse — never silently
    /// fabricated.
    pub fn load(&self, unit: &UnitId) -> Result<Option<LongTermRecord>> {
        let path = self.document_path(unit);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        let value: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|_| MemoryError::CorruptState { path: path.clone() })?;
        let upgraded = upgrade_document(value);
        let record: LongTermRecord = serde_json::from_value(upgraded)
            .map_err(|_| MemoryError::CorruptState { path })?;
        Ok(Some(record))
    }

    pub fn save(&self, unit: &UnitId, record: &LongTermRecord) -> Result<()> {
        let path = self.document_path(unit);
        let body = serde_json::to_vec_pretty(record)?;
        atomic_write(&path, &body)
    }

    /// Units discovered from the documents directory, optionally filtered to
    /// one profile.
    pub fn list_units(&self, profile: Option<&str>) -> Result<Vec<UnitId>> {
        let mut out = Vec::new();
        if !self.memory_root.exists() {
            return Ok(out);
        }
        let mut stems: Vec<String> = fs::read_dir(&self.memory_root)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "json") {
                    path.file_stem().map(|s| s.to_string_lossy().into_owned())
                } else {
                    None
                }
            })
            .collect();
        stems.sort();
        for stem in stems {
            if let Some(unit) = UnitId::from_stem(&stem) {
                if profile.is_none_or(|p| unit.profile == p) {
                    out.push(unit);
                }
            }
        }
        Ok(out)
    }

    pub fn purge(&self, unit: &UnitId) -> Result<()> {
        for path in [
            self.document_path(unit),
            self.short_path(unit),
            self.mapping_path(unit),
            self.vectors_path(unit),
        ] {
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    // ── Short-term line-log ─────────────────────────────────────────────

    /// Appends one entry to the unit's short-term log. Each line is an
    /// independently parseable record; a crash mid-append leaves at worst a
    /// truncated trailing line, discarded on the next read.
    pub fn append_short(&self, unit: &UnitId, entry: &ShortTermEntry) -> Result<()> {
        let path = self.short_path(unit);
        let append = || -> std::io::Result<()> {
            let mut line = serde_json::to_string(entry).map_err(std::io::Error::other)?;
            line.push('\n');
            let mut file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
            file.write_all(line.as_bytes())?;
            file.flush()
        };
        append().map_err(|source| MemoryError::WriteFailure { path, source })
    }

    /// The unit's short-term window, oldest first.
    pub fn read_short(&self, unit: &UnitId) -> Result<Vec<ShortTermEntry>> {
        read_jsonl(&self.short_path(unit))
    }

    /// Atomically rewrites the short-term log; used after compaction evicts
    /// the consumed entries.
    pub fn write_short(&self, unit: &UnitId, entries: &[ShortTermEntry]) -> Result<()> {
        write_jsonl(&self.short_path(unit), entries)
    }

    // ── Index mapping log ───────────────────────────────────────────────

    pub fn read_mapping(&self, unit: &UnitId) -> Result<Vec<IndexRecord>> {
        read_jsonl(&self.mapping_path(unit))
    }

    pub fn write_mapping(&self, unit: &UnitId, records: &[IndexRecord]) -> Result<()> {
        write_jsonl(&self.mapping_path(unit), records)
    }

    // ── Vector blob ─────────────────────────────────────────────────────

    /// Reads the opaque vector blob: `[dim: u32][count: u32]` header followed
    /// by `dim * count` little-endian f32s. An unreadable or short blob is
    /// `None` — the blob is derived state, rebuilt on demand.
    pub fn read_vectors(&self, unit: &UnitId) -> Result<Option<(usize, Vec<Vec<f32>>)>> {
        let path = self.vectors_path(unit);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        if bytes.len() < 8 {
            return Ok(None);
        }
        let dim = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        let count = u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize;
        let expected = 8 + dim * count * 4;
        if dim == 0 || bytes.len() < expected {
            debug!(path = %path.display(), "short vector blob, forcing rebuild");
            return Ok(None);
        }
        let mut rows = Vec::with_capacity(count);
        let mut offset = 8;
        for _ in 0..count {
            let mut row = Vec::with_capacity(dim);
            for _ in 0..dim {
                row.push(f32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap()));
                offset += 4;
            }
            rows.push(row);
        }
        Ok(Some((dim, rows)))
    }

    pub fn write_vectors(&self, unit: &UnitId, dim: usize, rows: &[Vec<f32>]) -> Result<()> {
        let mut bytes = Vec::with_capacity(8 + rows.len() * dim * 4);
        bytes.extend_from_slice(&(dim as u32).to_le_bytes());
        bytes.extend_from_slice(&(rows.len() as u32).to_le_bytes());
        for row in rows {
            for value in row {
                bytes.extend_from_slice(&value.to_le_bytes());
            }
        }
        atomic_write(&self.vectors_path(unit), &bytes)
    }
}

/// Write-to-temp-then-rename in the target's directory. The rename is the
/// commit point; a crash before it leaves the previous version untouched.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let write = || -> std::io::Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    };
    write().map_err(|source| MemoryError::WriteFailure {
        path: path.to_path_buf(),
        source,
    })
}

/// Reads a line-log where every line is an independently parseable record.
/// A malformed *final* line is a truncated append and is discarded silently;
/// a malformed interior line is skipped with a warning.
pub(crate) fn read_jsonl<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = fs::read_to_string(path)?;
    let lines: Vec<&str> = raw.lines().filter(|l| !l.trim().is_empty()).collect();
    let mut out = Vec::with_capacity(lines.len());
    for (i, line) in lines.iter().enumerate() {
        match serde_json::from_str::<T>(line) {
            Ok(record) => out.push(record),
            Err(_) if i + 1 == lines.len() => {
                debug!(path = %path.display(), "discarding truncated trailing line");
            }
            Err(err) => {
                warn!(path = %path.display(), line = i + 1, %err, "skipping malformed line");
            }
        }
    }
    Ok(out)
}

pub(crate) fn write_jsonl<T: serde::Serialize>(path: &Path, records: &[T]) -> Result<()> {
    let mut body = String::new();
    for record in records {
        body.push_str(&serde_json::to_string(record)?);
        body.push('\n');
    }
    atomic_write(path, body.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LongTermRecord;

    fn store() -> (tempfile::TempDir, DurableStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DurableStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn missing_document_is_none() {
        let (_dir, store) = store();
        let unit = UnitId::npc("p", "ghost");
        assert!(store.load(&unit).unwrap().is_none());
    }

    #[test]
    fn save_then_load_round_trips() {
        let (_dir, store) = store();
        let unit = UnitId::npc("p", "smith");
        let record = LongTermRecord::empty(&unit);
        store.save(&unit, &record).unwrap();
        let loaded = store.load(&unit).unwrap().unwrap();
        assert_eq!(loaded.unit_key, unit.stem());
    }

    #[test]
    fn malformed_document_is_corrupt_state() {
        let (_dir, store) = store();
        let unit = UnitId::npc("p", "smith");
        fs::write(store.document_path(&unit), b"{ not json").unwrap();
        match store.load(&unit) {
            Err(MemoryError::CorruptState { .. }) => {}
            other => panic!("expected CorruptState, got {other:?}"),
        }
    }

    #[test]
    fn truncated_trailing_jsonl_line_is_discarded() {
        let (dir, _store) = store();
        let path = dir.path().join("log.jsonl");
        fs::write(&path, "{\"a\":1}\n{\"a\":2}\n{\"a\":").unwrap();
        let rows: Vec<serde_json::Value> = read_jsonl(&path).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn short_log_appends_and_rewrites() {
        let (_dir, store) = store();
        let unit = UnitId::npc("p", "smith");
        let first = crate::model::ShortTermEntry::new(crate::model::Speaker::Player, "hello");
        let second = crate::model::ShortTermEntry::new(crate::model::Speaker::Npc, "well met");
        store.append_short(&unit, &first).unwrap();
        store.append_short(&unit, &second).unwrap();

        let entries = store.read_short(&unit).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].text, "hello");

        store.write_short(&unit, &entries[1..]).unwrap();
        let entries = store.read_short(&unit).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].text, "well met");
    }

    #[test]
    fn truncated_short_log_tail_is_discarded() {
        let (_dir, store) = store();
        let unit = UnitId::npc("p", "smith");
        let entry = crate::model::ShortTermEntry::new(crate::model::Speaker::Player, "hello");
        store.append_short(&unit, &entry).unwrap();
        // Simulate a crash mid-append: a partial trailing line.
        let mut raw = fs::read_to_string(store.short_path(&unit)).unwrap();
        raw.push_str("{\"turn_id\":\"xyz");
        fs::write(store.short_path(&unit), raw).unwrap();

        let entries = store.read_short(&unit).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn vector_blob_round_trips() {
        let (_dir, store) = store();
        let unit = UnitId::npc("p", "smith");
        let rows = vec![vec![1.0_f32, 0.0, 0.0], vec![0.0, 1.0, 0.0]];
        store.write_vectors(&unit, 3, &rows).unwrap();
        let (dim, back) = store.read_vectors(&unit).unwrap().unwrap();
        assert_eq!(dim, 3);
        assert_eq!(back, rows);
    }

    #[test]
    fn short_vector_blob_forces_rebuild() {
        let (_dir, store) = store();
        let unit = UnitId::npc("p", "smith");
        fs::write(store.vectors_path(&unit), [0u8; 5]).unwrap();
        assert!(store.read_vectors(&unit).unwrap().is_none());
    }

    #[test]
    fn list_units_filters_by_profile() {
        let (_dir, store) = store();
        for unit in [
            UnitId::npc("alice", "smith"),
            UnitId::npc("bob", "smith"),
            UnitId::world("alice"),
        ] {
            store.save(&unit, &LongTermRecord::empty(&unit)).unwrap();
        }
        assert_eq!(store.list_units(None).unwrap().len(), 3);
        assert_eq!(store.list_units(Some("alice")).unwrap().len(), 2);
    }
}
