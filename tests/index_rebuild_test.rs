// tests/index_rebuild_test.rs

mod common;

use keepsake::{Impact, MemoryItem, Speaker, UnitId};

use common::service_with_stub;

async fn seed(service: &keepsake::MemoryService, unit: &UnitId) {
    service
        .remember(
            unit,
            MemoryItem::Fact {
                subject: "miller".into(),
                predicate: "owns".into(),
                object: "the old mill".into(),
                confidence: 0.8,
            },
        )
        .await
        .unwrap();
    service
        .remember(
            unit,
            MemoryItem::Event {
                description: "a fight at the mill bridge".into(),
                participants: vec!["player".into(), "miller".into()],
                impact: Impact::Med,
            },
        )
        .await
        .unwrap();
    service
        .remember(
            unit,
            MemoryItem::Promise {
                description: "repair the water wheel by spring".into(),
                due: None,
            },
        )
        .await
        .unwrap();
    for i in 0..25 {
        service
            .append_short(unit, Speaker::Player, &format!("mill gossip {i}"), &[])
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn rebuild_twice_produces_identical_rankings() {
    let dir = tempfile::tempdir().unwrap();
    let service = service_with_stub(dir.path());
    let unit = UnitId::npc("alice", "miller");
    seed(&service, &unit).await;

    let first = service.rebuild_index(&unit).await.unwrap();
    let ranked_first = service.retrieve(&unit, "the mill", 5, &[]).await.unwrap();

    let second = service.rebuild_index(&unit).await.unwrap();
    let ranked_second = service.retrieve(&unit, "the mill", 5, &[]).await.unwrap();

    assert_eq!(first, second);
    assert!(!ranked_first.is_empty());
    let refs_first: Vec<&str> = ranked_first.iter().map(|f| f.source_ref.as_str()).collect();
    let refs_second: Vec<&str> = ranked_second.iter().map(|f| f.source_ref.as_str()).collect();
    assert_eq!(refs_first, refs_second);
    for (a, b) in ranked_first.iter().zip(&ranked_second) {
        assert!((a.score - b.score).abs() < 1e-6);
    }
}

#[tokio::test]
async fn vector_ids_are_stable_across_rebuilds() {
    let dir = tempfile::tempdir().unwrap();
    let service = service_with_stub(dir.path());
    let unit = UnitId::npc("alice", "miller");
    seed(&service, &unit).await;

    service.rebuild_index(&unit).await.unwrap();
    let store = keepsake::store::DurableStore::new(dir.path()).unwrap();
    let mut first: Vec<(String, String)> = store
        .read_mapping(&unit)
        .unwrap()
        .into_iter()
        .map(|r| (r.source_ref, r.vector_id))
        .collect();

    service.rebuild_index(&unit).await.unwrap();
    let mut second: Vec<(String, String)> = store
        .read_mapping(&unit)
        .unwrap()
        .into_iter()
        .map(|r| (r.source_ref, r.vector_id))
        .collect();

    first.sort();
    second.sort();
    assert_eq!(first, second);
}

#[tokio::test]
async fn rebuild_all_covers_every_unit() {
    let dir = tempfile::tempdir().unwrap();
    let service = service_with_stub(dir.path());
    let miller = UnitId::npc("alice", "miller");
    let world = UnitId::world("alice");
    seed(&service, &miller).await;
    service
        .append_short(&world, Speaker::System, "harvest festival began", &[])
        .await
        .unwrap();
    service
        .remember(
            &world,
            MemoryItem::Event {
                description: "the river flooded the lower fields".into(),
                participants: vec![],
                impact: Impact::High,
            },
        )
        .await
        .unwrap();

    let total = service.rebuild_all(Some("alice")).await.unwrap();
    assert!(total >= 2);

    let report = service.check_consistency().await.unwrap();
    assert!(report.is_clean(), "unexpected report: {report:?}");
    assert_eq!(report.units, 2);
}

#[tokio::test]
async fn consistency_check_flags_dangling_refs() {
    let dir = tempfile::tempdir().unwrap();
    let service = service_with_stub(dir.path());
    let unit = UnitId::npc("alice", "miller");
    seed(&service, &unit).await;
    service.rebuild_index(&unit).await.unwrap();

    // Rewrite the document without its collections; mapped refs now dangle.
    let store = keepsake::store::DurableStore::new(dir.path()).unwrap();
    let mut record = store.load(&unit).unwrap().unwrap();
    record.facts.clear();
    record.events.clear();
    record.promises.clear();
    record.chunks.clear();
    store.save(&unit, &record).unwrap();

    let report = service.check_consistency().await.unwrap();
    assert!(!report.is_clean());
    assert!(!report.dangling_refs.is_empty());
}
