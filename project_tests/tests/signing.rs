use lib_live::{MountOptions, SignOptions, SignatureConfig, StateSigner};
use project_tests::{TestEngine, drain, frames_of_type};
use serde_json::json;

#[tokio::test]
async fn test_rotated_key_keeps_live_envelopes_valid() {
    let engine = TestEngine::new();
    let _rx = engine.connect("conn-a");
    let mounted = engine
        .registry
        .mount("conn-a", "Counter", &json!({"count": 2}), MountOptions::default())
        .unwrap();
    engine.registry.unmount(&mounted.component_id);

    engine.signer().rotate_key("second-secret").unwrap();

    let result = engine
        .registry
        .rehydrate(&mounted.component_id, "Counter", &mounted.signed_state, "conn-a", MountOptions::default())
        .unwrap();
    assert!(result.success);

    // New envelopes are signed with the new key only.
    let fresh = result.signed_state.unwrap();
    let old_only = StateSigner::new(SignatureConfig::with_secret(project_tests::TEST_SECRET)).unwrap();
    assert!(!old_only.validate(&fresh, None).valid);
    let new_only = StateSigner::new(SignatureConfig::with_secret("second-secret")).unwrap();
    assert!(new_only.validate(&fresh, None).valid);
}

#[tokio::test]
async fn test_retired_keys_are_bounded() {
    let signer = StateSigner::new(SignatureConfig {
        retired_key_limit: 1,
        ..SignatureConfig::with_secret("k0")
    })
    .unwrap();
    let envelope = signer.sign("c1", &json!({"a": 1}), 1, SignOptions::default()).unwrap();

    signer.rotate_key("k1").unwrap();
    assert!(signer.validate(&envelope, None).valid);

    signer.rotate_key("k2").unwrap();
    let result = signer.validate(&envelope, None);
    assert!(!result.valid);
    assert!(result.tampered);
}

#[tokio::test]
async fn test_large_and_encrypted_state_round_trips_through_rehydrate() {
    let engine = TestEngine::with_config(|c| {
        c.registry.compression_threshold_bytes = 64;
        c.registry.encrypt_state = true;
    });
    let mut rx = engine.connect("conn-a");
    let notes: Vec<String> = (0..50).map(|i| format!("note number {}", i)).collect();
    let mounted = engine
        .registry
        .mount("conn-a", "Counter", &json!({"notes": notes}), MountOptions::default())
        .unwrap();
    assert!(mounted.signed_state.compressed);
    assert!(mounted.signed_state.encrypted);
    assert!(mounted.signed_state.data.is_string());
    drain(&mut rx);

    engine.registry.unmount(&mounted.component_id);
    let result = engine
        .registry
        .rehydrate(&mounted.component_id, "Counter", &mounted.signed_state, "conn-a", MountOptions::default())
        .unwrap();
    let state = result.state.unwrap();
    assert_eq!(state["notes"].as_array().unwrap().len(), 50);
    assert_eq!(state["notes"][49], "note number 49");

    let frames = drain(&mut rx);
    assert_eq!(frames_of_type(&frames, "STATE_REHYDRATED").len(), 1);
}

#[tokio::test]
async fn test_migration_upgrades_mounted_state() {
    let engine = TestEngine::new();
    let mut rx = engine.connect("conn-a");
    engine.signer().register_migration(1, 2, |mut state| {
        let count = state["count"].as_i64().unwrap_or(0);
        state["count"] = json!({"value": count});
        Ok(state)
    });

    let mounted = engine
        .registry
        .mount("conn-a", "Counter", &json!({"count": 4}), MountOptions::default())
        .unwrap();
    drain(&mut rx);

    assert!(engine.registry.migrate_component(&mounted.component_id, 2).unwrap());
    assert_eq!(
        engine.registry.component_state(&mounted.component_id).unwrap()["count"],
        json!({"value": 4})
    );
    let meta = engine.registry.metadata(&mounted.component_id).unwrap();
    assert_eq!(meta.version, 2);
    assert_eq!(meta.migration_history.len(), 1);
    assert!(meta.migration_history[0].success);

    let frames = drain(&mut rx);
    assert_eq!(frames_of_type(&frames, "STATE_UPDATE")[0]["payload"]["version"], 2);

    // No path to version 9.
    assert!(!engine.registry.migrate_component(&mounted.component_id, 9).unwrap());
    let meta = engine.registry.metadata(&mounted.component_id).unwrap();
    assert_eq!(meta.migration_history.len(), 2);
    assert!(!meta.migration_history[1].success);
}

#[tokio::test]
async fn test_backups_follow_each_signed_version() {
    let engine = TestEngine::new();
    let _rx = engine.connect("conn-a");
    let mounted = engine
        .registry
        .mount("conn-a", "Counter", &json!({}), MountOptions::default())
        .unwrap();
    for _ in 0..3 {
        engine
            .registry
            .execute_action(&mounted.component_id, "increment", json!({}))
            .unwrap();
    }

    let latest = engine.signer().latest_backup(&mounted.component_id).unwrap();
    assert_eq!(latest.version, 4);
    assert_eq!(latest.data["count"], 3);
    assert_eq!(
        engine.signer().recover_from_backup(&mounted.component_id, 2).unwrap()["count"],
        1
    );

    let removed = engine
        .signer()
        .prune_backups(std::time::Duration::ZERO, lib_live::utils::now_millis() + 1_000);
    assert_eq!(removed, 4);
    assert_eq!(engine.signer().backup_count(), 0);
}
