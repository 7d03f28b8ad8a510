// tests/bootstrap_test.rs

mod common;

use std::fs;
use std::path::Path;

use keepsake::UnitId;

use common::service_degraded;

fn write_legacy_saves(root: &Path) {
    let profile_dir = root.join("profiles").join("alice");
    fs::create_dir_all(&profile_dir).unwrap();
    let slot = serde_json::json!({
        "version": 2,
        "state": {
            "conversation_short_term": {
                "market_merchant": [
                    {
                        "at": "2026-02-20T10:00:00+00:00",
                        "role": "player",
                        "text": "I promise to come back with the ore.",
                    },
                    {
                        "at": "2026-02-20T10:01:00+00:00",
                        "role": "npc",
                        "text": "Then the discount holds until you return.",
                    },
                ],
            },
            "conversation_long_term": {
                "market_merchant": [
                    {
                        "at": "2026-02-19T18:00:00+00:00",
                        "kind": "promise",
                        "summary": "The player promised to deliver iron ore.",
                    },
                    {
                        "at": "2026-02-19T18:05:00+00:00",
                        "kind": "quest",
                        "summary": "An escort to the mines was arranged.",
                    },
                    {
                        "at": "2026-02-19T18:10:00+00:00",
                        "kind": "general",
                        "summary": "The merchant trades mostly in tools.",
                    },
                ],
            },
            "conversation_global_long_term": [
                {
                    "at": "2026-02-18T09:00:00+00:00",
                    "summary": "A caravan was lost on the mountain pass.",
                },
            ],
        },
    });
    fs::write(
        profile_dir.join("slot_1.json"),
        serde_json::to_vec_pretty(&slot).unwrap(),
    )
    .unwrap();
}

async fn record_counts(
    service: &keepsake::MemoryService,
    unit: &UnitId,
) -> (usize, usize, usize, usize) {
    let record = service.load_record(unit).unwrap().unwrap();
    (
        service.read_short(unit).await.unwrap().len(),
        record.facts.len(),
        record.events.len(),
        record.promises.len(),
    )
}

#[tokio::test]
async fn bootstrap_ingests_legacy_history() {
    let dir = tempfile::tempdir().unwrap();
    let saves = dir.path().join("saves");
    write_legacy_saves(&saves);
    let service = service_degraded(dir.path().join("data").as_path());

    let stats = service.bootstrap(&saves).await.unwrap();
    assert_eq!(stats.slots, 1);
    assert_eq!(stats.units_touched, 2); // merchant + world
    assert_eq!(stats.short_added, 2);
    assert_eq!(stats.long_added, 3);
    assert_eq!(stats.world_added, 1);

    let merchant = UnitId::npc("alice", "market_merchant");
    let (short, facts, events, promises) = record_counts(&service, &merchant).await;
    assert_eq!(short, 2);
    assert!(facts >= 1);
    assert_eq!(events, 1);
    assert_eq!(promises, 1);

    let world = UnitId::world("alice");
    let record = service.load_record(&world).unwrap().unwrap();
    assert_eq!(record.events.len(), 1);
    assert!(!record.summary.text.is_empty());
}

#[tokio::test]
async fn bootstrap_twice_adds_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let saves = dir.path().join("saves");
    write_legacy_saves(&saves);
    let service = service_degraded(dir.path().join("data").as_path());

    service.bootstrap(&saves).await.unwrap();
    let merchant = UnitId::npc("alice", "market_merchant");
    let world = UnitId::world("alice");
    let first_merchant = record_counts(&service, &merchant).await;
    let first_world = service.load_record(&world).unwrap().unwrap().events.len();

    let stats = service.bootstrap(&saves).await.unwrap();
    assert_eq!(stats.units_touched, 0);
    assert_eq!(stats.units_skipped, 2);
    assert_eq!(record_counts(&service, &merchant).await, first_merchant);
    assert_eq!(
        service.load_record(&world).unwrap().unwrap().events.len(),
        first_world
    );
}

#[tokio::test]
async fn migrated_memories_are_retrievable_without_embeddings() {
    let dir = tempfile::tempdir().unwrap();
    let saves = dir.path().join("saves");
    write_legacy_saves(&saves);
    let service = service_degraded(dir.path().join("data").as_path());
    service.bootstrap(&saves).await.unwrap();

    let merchant = UnitId::npc("alice", "market_merchant");
    let fragments = service
        .retrieve(&merchant, "iron ore", 5, &[])
        .await
        .unwrap();
    assert!(!fragments.is_empty());
    assert!(fragments.iter().any(|f| f.text.contains("iron ore")));
}
