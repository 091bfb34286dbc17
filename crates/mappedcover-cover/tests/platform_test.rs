//! Entry setup and unload

use std::sync::Arc;
use std::time::Duration;

use mappedcover_core::{EntityRegistry, EntryConfig, InMemoryEntityRegistry, RegistryEntry, SourceState};
use mappedcover_cover::{MappedCoverPlatform, PlatformError};
use mappedcover_devices::{CoverSimulator, DeviceStateStore, SimulatedCover, TravelMode};

fn platform() -> (Arc<InMemoryEntityRegistry>, Arc<CoverSimulator>, MappedCoverPlatform) {
    let store = DeviceStateStore::new();
    let sim = Arc::new(CoverSimulator::new(store.clone()));
    sim.add_cover(SimulatedCover::new("cover.kitchen", SourceState::available(40).with_tilt(20)));
    sim.add_cover(SimulatedCover::new("cover.office", SourceState::available(0)));

    let registry = Arc::new(InMemoryEntityRegistry::new());
    let platform = MappedCoverPlatform::new(registry.clone(), sim.clone(), Arc::new(store));
    (registry, sim, platform)
}

fn entry() -> EntryConfig {
    EntryConfig::new(
        "blinds",
        vec!["cover.kitchen".to_string(), "cover.office".to_string()],
    )
}

#[tokio::test]
async fn test_setup_registers_covers() {
    let (registry, _sim, platform) = platform();
    registry.set_device_name("cover.kitchen", "Kitchen Blind");
    registry.set_device_area("cover.kitchen", "kitchen");

    let covers = platform.setup_entry(&entry()).await.unwrap();
    assert_eq!(covers.len(), 2);
    assert!(platform.is_loaded("blinds"));

    let kitchen = registry.get("blinds_cover.kitchen").unwrap();
    assert_eq!(kitchen.name, "Mapped Kitchen Blind");
    assert_eq!(kitchen.area.as_deref(), Some("kitchen"));

    let office = registry.get("blinds_cover.office").unwrap();
    assert_eq!(office.name, "Mapped cover.office");
    assert_eq!(office.area, None);

    assert!(platform.cover("blinds_cover.kitchen").unwrap().capabilities().tilt);
    assert!(!platform.cover("blinds_cover.office").unwrap().capabilities().tilt);
}

#[tokio::test]
async fn test_setup_applies_rename_rule() {
    let (registry, _sim, platform) = platform();
    registry.set_device_name("cover.kitchen", "Kitchen Blind");

    let mut entry = entry();
    entry.rename_pattern = "Blind$".to_string();
    entry.rename_replacement = "Shade".to_string();
    platform.setup_entry(&entry).await.unwrap();

    assert_eq!(registry.get("blinds_cover.kitchen").unwrap().name, "Kitchen Shade");
    // No match leaves the name as it was
    assert_eq!(registry.get("blinds_cover.office").unwrap().name, "cover.office");
}

#[tokio::test]
async fn test_setup_removes_stale_entities() {
    let (registry, _sim, platform) = platform();
    registry
        .register(RegistryEntry {
            entity_id: "blinds_cover.garage".to_string(),
            entry_id: "blinds".to_string(),
            source_id: "cover.garage".to_string(),
            name: "Mapped cover.garage".to_string(),
            area: None,
        })
        .await
        .unwrap();

    platform.setup_entry(&entry()).await.unwrap();
    assert!(registry.get("blinds_cover.garage").is_none());
    assert_eq!(registry.entities_for_entry("blinds").await.len(), 2);
}

#[tokio::test]
async fn test_setup_rejects_invalid_entry() {
    let (registry, _sim, platform) = platform();
    let entry = entry().with_position_range(0, 150);
    assert!(matches!(
        platform.setup_entry(&entry).await,
        Err(PlatformError::Config(_))
    ));
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_reload_replaces_covers() {
    let (registry, _sim, platform) = platform();
    platform.setup_entry(&entry()).await.unwrap();

    let narrowed = EntryConfig::new("blinds", vec!["cover.office".to_string()]);
    platform.setup_entry(&narrowed).await.unwrap();

    assert_eq!(platform.covers("blinds").len(), 1);
    assert_eq!(registry.len(), 1);
    assert!(registry.get("blinds_cover.office").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_unload_stops_runs_and_removes_entities() {
    let (registry, sim, platform) = platform();
    sim.set_travel("cover.kitchen", TravelMode::Stuck);
    platform.setup_entry(&entry()).await.unwrap();

    let kitchen = platform.cover("blinds_cover.kitchen").unwrap();
    kitchen.set_position(90).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    let calls = sim.call_count();
    assert!(calls > 0);

    platform.unload_entry("blinds").await.unwrap();
    assert!(registry.is_empty());
    assert!(!platform.is_loaded("blinds"));
    assert_eq!(kitchen.live_runs(), 0);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(sim.call_count(), calls);

    assert!(matches!(
        platform.unload_entry("blinds").await,
        Err(PlatformError::NotLoaded(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_entries_load_independently() {
    let (_registry, _sim, platform) = platform();
    platform.setup_entry(&entry()).await.unwrap();
    platform
        .setup_entry(&EntryConfig::new("office", vec!["cover.office".to_string()]).with_throttle_ms(250))
        .await
        .unwrap();

    assert_eq!(platform.entry_ids(), vec!["blinds".to_string(), "office".to_string()]);
    assert_eq!(
        platform.dispatcher("office").unwrap().interval(),
        Duration::from_millis(250)
    );
    let snapshots = platform.snapshots("office");
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].unique_id, "office_cover.office");
    assert!(snapshots[0].is_closed);

    platform.shutdown().await.unwrap();
    assert!(platform.entry_ids().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_entries_mapping_one_device_share_its_throttle() {
    let (_registry, sim, platform) = platform();
    platform
        .setup_entry(&entry().with_throttle_ms(1000))
        .await
        .unwrap();
    platform
        .setup_entry(&EntryConfig::new("office", vec!["cover.office".to_string()]).with_throttle_ms(1000))
        .await
        .unwrap();

    let from_blinds = platform.cover("blinds_cover.office").unwrap();
    let from_office = platform.cover("office_cover.office").unwrap();
    from_blinds.set_position(90).await.unwrap();
    from_office.set_position(30).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    let calls = sim.calls_for("cover.office");
    assert!(calls.len() >= 2);
    for pair in calls.windows(2) {
        assert!(pair[1].at - pair[0].at >= Duration::from_millis(1000));
    }
    platform.shutdown().await.unwrap();
}
