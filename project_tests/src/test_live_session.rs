//! # Live Session Walkthrough
//!
//! Drives an in-process engine through a full client session (mount, action,
//! disconnect, rehydrate on a new connection) and prints every frame.

use project_tests::{TestEngine, drain};
use serde_json::{Value, json};

fn print_frames(label: &str, frames: &[Value]) -> anyhow::Result<()> {
    for frame in frames {
        println!("[{}] {}", label, serde_json::to_string(frame)?);
    }
    Ok(())
}

/// Executes the scripted session.
///
/// // Statement: Exits non-zero when the rehydrated state does not match.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // // Statement: Console tracing so engine logs interleave with the frames
    tracing_subscriber::fmt().with_target(true).init();

    let engine = TestEngine::new();
    let mut first = engine.connect("session-1");

    println!("[*] Mounting Counter on session-1...");
    let replies = engine
        .send(
            "session-1",
            json!({"type": "COMPONENT_MOUNT", "payload": {"component": "Counter"}, "requestId": "m1"}),
        )
        .await;
    let component_id = replies[0]
        .component_id
        .clone()
        .ok_or_else(|| anyhow::anyhow!("mount failed: {:?}", replies[0].error))?;

    for i in 0..3 {
        let request_id = format!("a{}", i);
        engine
            .send(
                "session-1",
                json!({"type": "CALL_ACTION", "componentId": component_id, "action": "increment", "requestId": request_id}),
            )
            .await;
    }
    let frames = drain(&mut first);
    print_frames("session-1", &frames)?;

    // // Statement: The last pushed envelope is what a browser would keep
    let signed = frames
        .iter()
        .rev()
        .find(|f| f["type"] == "STATE_UPDATE")
        .map(|f| f["payload"]["signedState"].clone())
        .ok_or_else(|| anyhow::anyhow!("no state update received"))?;

    println!("[*] Dropping session-1...");
    let removed = engine.registry.cleanup_connection("session-1");
    println!("[INFO] components removed: {}", removed);

    let mut second = engine.connect("session-2");
    println!("[*] Rehydrating on session-2...");
    let replies = engine
        .send(
            "session-2",
            json!({
                "type": "COMPONENT_REHYDRATE",
                "componentId": component_id,
                "requestId": "h1",
                "payload": {"componentName": "Counter", "signedState": signed},
            }),
        )
        .await;
    for reply in &replies {
        println!("[reply] {}", reply.to_json());
    }
    print_frames("session-2", &drain(&mut second))?;

    let new_id = replies[0].component_id.clone().unwrap_or_default();
    match engine.registry.component_state(&new_id) {
        Some(state) if state["count"] == 3 => {
            println!("\n[SUCCESS] state restored: {}", state);
        }
        other => {
            eprintln!("\n[ERROR] unexpected state after rehydration: {:?}", other);
            std::process::exit(1);
        }
    }

    println!("-----------------------------------------------");
    println!("{}", serde_json::to_string_pretty(&engine.registry.stats())?);
    println!("-----------------------------------------------");
    Ok(())
}
