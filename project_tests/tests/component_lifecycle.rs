use lib_live::{ComponentDefinition, LiveError, MountOptions, ServerMessageType, SignedState};
use project_tests::{TestEngine, drain, frames_of_type};
use serde_json::{Value, json};

#[tokio::test]
async fn test_mount_action_unmount_then_rehydrate() {
    let engine = TestEngine::new();
    let mut rx = engine.connect("conn-a");

    let mounted = engine
        .registry
        .mount("conn-a", "Counter", &json!({"count": 5}), MountOptions::default())
        .unwrap();
    assert_eq!(mounted.initial_state, json!({"count": 5, "label": "clicks"}));
    assert_eq!(mounted.signed_state.version, 1);

    let result = engine
        .registry
        .execute_action(&mounted.component_id, "increment", json!({"by": 2}))
        .unwrap();
    assert_eq!(result, json!({"count": 7}));

    let frames = drain(&mut rx);
    let updates = frames_of_type(&frames, "STATE_UPDATE");
    // One for the mount announcement, one for the action.
    assert_eq!(updates.len(), 2);
    let latest = updates[1];
    assert_eq!(latest["payload"]["state"]["count"], 7);
    assert_eq!(latest["payload"]["version"], 2);
    let envelope: SignedState = serde_json::from_value(latest["payload"]["signedState"].clone()).unwrap();

    assert!(engine.registry.unmount(&mounted.component_id));
    let err = engine
        .registry
        .execute_action(&mounted.component_id, "increment", json!({}))
        .unwrap_err();
    assert!(matches!(err, LiveError::RehydrationRequired { .. }));

    let rehydrated = engine
        .registry
        .rehydrate(&mounted.component_id, "Counter", &envelope, "conn-a", MountOptions::default())
        .unwrap();
    assert!(rehydrated.success);
    let new_id = rehydrated.new_component_id.unwrap();
    assert_ne!(new_id, mounted.component_id);
    assert_eq!(engine.registry.component_state(&new_id).unwrap()["count"], 7);
    assert_eq!(engine.registry.metadata(&new_id).unwrap().version, 3);

    let frames = drain(&mut rx);
    assert_eq!(frames_of_type(&frames, "STATE_REHYDRATED").len(), 1);
}

#[tokio::test]
async fn test_tampered_envelope_is_not_instantiated() {
    let engine = TestEngine::new();
    let _rx = engine.connect("conn-a");
    let mounted = engine
        .registry
        .mount("conn-a", "Counter", &json!({}), MountOptions::default())
        .unwrap();
    engine.registry.unmount(&mounted.component_id);

    let mut forged = mounted.signed_state.clone();
    forged.data["count"] = json!(1_000_000);
    let result = engine
        .registry
        .rehydrate(&mounted.component_id, "Counter", &forged, "conn-a", MountOptions::default())
        .unwrap();
    assert!(!result.success);
    assert_eq!(result.reason.map(|r| r.code()), Some("SIGNATURE_TAMPERED"));
    assert!(engine.registry.component_ids().is_empty());

    // A valid envelope presented under another component's id is rejected too.
    let result = engine
        .registry
        .rehydrate("live-someone-else", "Counter", &mounted.signed_state, "conn-a", MountOptions::default())
        .unwrap();
    assert!(!result.success);
}

#[tokio::test]
async fn test_expired_envelope_is_rejected() {
    let engine = TestEngine::with_config(|c| c.signature.max_age_ms = 1_000);
    let _rx = engine.connect("conn-a");
    let mounted = engine
        .registry
        .mount("conn-a", "Counter", &json!({}), MountOptions::default())
        .unwrap();
    engine.registry.unmount(&mounted.component_id);

    let stale = engine
        .signer()
        .sign_at(
            &mounted.component_id,
            &json!({"count": 3}),
            1,
            Default::default(),
            lib_live::utils::now_millis() - 60_000,
        )
        .unwrap();
    let result = engine
        .registry
        .rehydrate(&mounted.component_id, "Counter", &stale, "conn-a", MountOptions::default())
        .unwrap();
    assert!(!result.success);
    assert_eq!(result.reason.map(|r| r.code()), Some("SIGNATURE_EXPIRED"));
}

#[tokio::test]
async fn test_out_of_range_timestamps_fail_cleanly() {
    let engine = TestEngine::new();
    let _rx = engine.connect("conn-a");
    let mounted = engine
        .registry
        .mount("conn-a", "Counter", &json!({}), MountOptions::default())
        .unwrap();
    engine.registry.unmount(&mounted.component_id);

    let ahead = lib_live::utils::now_millis() + 3_600_000;
    for (timestamp, code) in [
        (i64::MIN, "SIGNATURE_EXPIRED"),
        (i64::MAX, "SIGNATURE_TAMPERED"),
        (ahead, "SIGNATURE_TAMPERED"),
    ] {
        let envelope = engine
            .signer()
            .sign_at(&mounted.component_id, &json!({"count": 9}), 1, Default::default(), timestamp)
            .unwrap();
        let replies = engine
            .send(
                "conn-a",
                json!({
                    "type": "COMPONENT_REHYDRATE",
                    "componentId": mounted.component_id,
                    "requestId": "h1",
                    "payload": {"componentName": "Counter", "signedState": envelope},
                }),
            )
            .await;
        assert_eq!(replies[0].success, Some(false));
        assert_eq!(replies[0].error_code.as_deref(), Some(code));
    }
    assert!(engine.registry.component_ids().is_empty());
}

#[tokio::test]
async fn test_unknown_component_lists_available() {
    let engine = TestEngine::new();
    let _rx = engine.connect("conn-a");
    let err = engine
        .registry
        .mount("conn-a", "Teleporter", &json!({}), MountOptions::default())
        .unwrap_err();
    match err {
        LiveError::ComponentNotFound { available, .. } => {
            assert!(available.contains(&"Counter".to_string()));
            assert!(available.contains(&"Wallet".to_string()));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_required_dependency_is_injected_or_mount_fails() {
    let engine = TestEngine::new();
    let _rx = engine.connect("conn-a");

    let wallet = engine
        .registry
        .mount("conn-a", "Wallet", &json!({}), MountOptions::default())
        .unwrap();
    engine
        .registry
        .execute_action(&wallet.component_id, "deposit", json!({"amount": 25}))
        .unwrap();
    assert_eq!(engine.audit.entries(), vec!["deposit 25".to_string()]);

    engine.registry.register(
        ComponentDefinition::builder("Mailer")
            .depends_on("smtp", true)
            .build(),
    );
    let err = engine
        .registry
        .mount("conn-a", "Mailer", &json!({}), MountOptions::default())
        .unwrap_err();
    assert_eq!(err.code(), "MISSING_DEPENDENCY");
}

#[tokio::test]
async fn test_failed_action_reports_and_keeps_component() {
    let engine = TestEngine::new();
    let _rx = engine.connect("conn-a");
    let wallet = engine
        .registry
        .mount("conn-a", "Wallet", &json!({}), MountOptions::default())
        .unwrap();

    let err = engine
        .registry
        .execute_action(&wallet.component_id, "withdraw", json!({"amount": 500}))
        .unwrap_err();
    assert_eq!(err.code(), "ACTION_FAILED");
    assert!(err.to_string().contains("insufficient funds"));
    assert!(engine.registry.is_mounted(&wallet.component_id));
    assert_eq!(engine.registry.metadata(&wallet.component_id).unwrap().metrics.error_count, 1);

    let err = engine
        .registry
        .execute_action(&wallet.component_id, "launder", Value::Null)
        .unwrap_err();
    assert_eq!(err.code(), "ACTION_NOT_FOUND");
}

#[tokio::test]
async fn test_room_broadcast_skips_sender() {
    let engine = TestEngine::new();
    let mut rx_a = engine.connect("conn-a");
    let mut rx_b = engine.connect("conn-b");
    let in_lobby = || MountOptions {
        room: Some("lobby".to_string()),
        ..Default::default()
    };

    let a = engine.registry.mount("conn-a", "RoomMember", &json!({}), in_lobby()).unwrap();
    let b = engine.registry.mount("conn-b", "RoomMember", &json!({}), in_lobby()).unwrap();
    assert_eq!(engine.registry.room_members("lobby").len(), 2);
    drain(&mut rx_a);
    drain(&mut rx_b);

    engine
        .registry
        .execute_action(&a.component_id, "say", json!({"text": "hi"}))
        .unwrap();

    let to_b = drain(&mut rx_b);
    let broadcasts = frames_of_type(&to_b, "BROADCAST");
    assert_eq!(broadcasts.len(), 1);
    assert_eq!(broadcasts[0]["componentId"], b.component_id.as_str());
    assert_eq!(broadcasts[0]["payload"]["event"], "said");
    assert_eq!(broadcasts[0]["payload"]["data"]["text"], "hi");
    assert!(broadcasts[0]["payload"]["from"].is_null());
    assert!(!broadcasts[0].to_string().contains(&a.component_id));

    let to_a = drain(&mut rx_a);
    assert!(frames_of_type(&to_a, "BROADCAST").is_empty());
    assert_eq!(frames_of_type(&to_a, "STATE_UPDATE").len(), 1);

    // Disconnecting b removes it from the room.
    assert_eq!(engine.registry.cleanup_connection("conn-b"), 1);
    assert_eq!(engine.registry.room_members("lobby"), vec![a.component_id.clone()]);
}

#[tokio::test]
async fn test_dispatcher_round_trip_over_protocol() {
    let engine = TestEngine::new();
    let mut rx = engine.connect("conn-a");

    let replies = engine
        .send(
            "conn-a",
            json!({"type": "COMPONENT_MOUNT", "payload": {"component": "Counter"}, "requestId": "m1"}),
        )
        .await;
    assert_eq!(replies[0].kind, ServerMessageType::ComponentMounted);
    assert_eq!(replies[0].success, Some(true));
    let id = replies[0].component_id.clone().unwrap();

    let replies = engine
        .send(
            "conn-a",
            json!({"type": "CALL_ACTION", "componentId": id, "action": "increment", "requestId": "a1", "expectResponse": true}),
        )
        .await;
    assert_eq!(replies[0].kind, ServerMessageType::MessageResponse);
    assert_eq!(replies[0].result, Some(json!({"count": 1})));

    engine
        .send("conn-a", json!({"type": "COMPONENT_UNMOUNT", "componentId": id}))
        .await;
    let replies = engine
        .send(
            "conn-a",
            json!({"type": "CALL_ACTION", "componentId": id, "action": "increment", "requestId": "a2"}),
        )
        .await;
    assert_eq!(replies[0].kind, ServerMessageType::ActionResponse);
    assert_eq!(replies[0].error_code.as_deref(), Some("REHYDRATION_REQUIRED"));

    let frames = drain(&mut rx);
    let last_update = frames_of_type(&frames, "STATE_UPDATE").pop().unwrap().clone();
    let replies = engine
        .send(
            "conn-a",
            json!({
                "type": "COMPONENT_REHYDRATE",
                "componentId": id,
                "requestId": "h1",
                "payload": {"componentName": "Counter", "signedState": last_update["payload"]["signedState"]},
            }),
        )
        .await;
    assert_eq!(replies[0].kind, ServerMessageType::ComponentRehydrated);
    assert_eq!(replies[0].success, Some(true));
    let new_id = replies[0].component_id.clone().unwrap();
    assert_eq!(engine.registry.component_state(&new_id).unwrap()["count"], 1);
}
