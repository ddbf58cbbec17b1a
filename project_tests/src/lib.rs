//! # Engine Fixtures
//!
//! A fully wired engine over a temporary upload directory, a few component
//! definitions with distinct behaviour, and helpers for reading the frames a
//! connection received.

use std::sync::{Arc, Mutex};

use anyhow::{Context, bail};
use base64::{Engine as _, engine::general_purpose};
use lib_live::{
    ComponentDefinition, ComponentRegistry, ConnectionManager, LiveConfig, OutboundFrame, PerformanceMonitor,
    ProtocolDispatcher, ServerMessage, ServiceContainer, SignatureConfig, StateSigner, UploadManager,
};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::sync::mpsc::{self, UnboundedReceiver};

pub const TEST_SECRET: &str = "project-tests-secret";

/// # Test Engine
pub struct TestEngine {
    pub registry: Arc<ComponentRegistry>,
    pub uploads: Arc<UploadManager>,
    pub dispatcher: ProtocolDispatcher,
    pub audit: Arc<AuditLog>,
    upload_dir: TempDir,
}

impl TestEngine {
    /// Default configuration with the fixture components registered.
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Lets a test adjust thresholds before the engine is built.
    pub fn with_config(adjust: impl FnOnce(&mut LiveConfig)) -> Self {
        let upload_dir = tempfile::tempdir().expect("create upload dir");
        let mut config = LiveConfig {
            signature: SignatureConfig::with_secret(TEST_SECRET),
            ..Default::default()
        };
        config.uploads.upload_dir = upload_dir.path().to_path_buf();
        adjust(&mut config);

        let signer = Arc::new(StateSigner::new(config.signature.clone()).expect("signer"));
        let connections = Arc::new(ConnectionManager::new(config.connections.clone()));
        let monitor = Arc::new(PerformanceMonitor::new(config.performance.clone()));
        let services = Arc::new(ServiceContainer::new());
        let registry = Arc::new(ComponentRegistry::new(
            config.registry.clone(),
            signer,
            connections,
            monitor,
            services,
        ));
        let uploads = Arc::new(UploadManager::new(config.uploads.clone()));

        let audit = Arc::new(AuditLog::default());
        registry.services().register_singleton("audit_log", AuditLogHandle(audit.clone()));
        registry.register(counter());
        registry.register(wallet());
        registry.register(flaky());
        registry.register(room_member());

        let dispatcher = ProtocolDispatcher::new(registry.clone(), uploads.clone());
        Self {
            registry,
            uploads,
            dispatcher,
            audit,
            upload_dir,
        }
    }

    /// Registers a connection and returns what the client would receive.
    pub fn connect(&self, connection_id: &str) -> UnboundedReceiver<OutboundFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.registry.connections().register_connection(connection_id, tx, None);
        rx
    }

    pub fn signer(&self) -> &Arc<StateSigner> {
        self.registry.signer()
    }

    pub fn upload_dir(&self) -> &std::path::Path {
        self.upload_dir.path()
    }

    /// Feeds one client frame through the dispatcher.
    pub async fn send(&self, connection_id: &str, frame: Value) -> Vec<ServerMessage> {
        self.dispatcher.handle(connection_id, &frame.to_string()).await
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Every frame currently queued for the connection, parsed.
pub fn drain(rx: &mut UnboundedReceiver<OutboundFrame>) -> Vec<Value> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(serde_json::from_str(&frame).expect("outbound frame is JSON"));
    }
    frames
}

pub fn frames_of_type<'a>(frames: &'a [Value], kind: &str) -> Vec<&'a Value> {
    frames.iter().filter(|f| f["type"] == kind).collect()
}

/// Base64 payload and SHA-256 hex digest for one upload chunk.
pub fn encode_chunk(bytes: &[u8]) -> (String, String) {
    (general_purpose::STANDARD.encode(bytes), hex::encode(Sha256::digest(bytes)))
}

// --- Services ---

#[derive(Default)]
pub struct AuditLog {
    entries: Mutex<Vec<String>>,
}

impl AuditLog {
    pub fn record(&self, entry: impl Into<String>) {
        self.entries.lock().expect("audit lock poisoned").push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().expect("audit lock poisoned").clone()
    }
}

/// The registered service value; shares the log with the test.
pub struct AuditLogHandle(pub Arc<AuditLog>);

// --- Components ---

pub fn counter() -> ComponentDefinition {
    ComponentDefinition::builder("Counter")
        .initial_state(json!({"count": 0, "label": "clicks"}))
        .action("increment", |ctx, payload| {
            let by = payload.get("by").and_then(Value::as_i64).unwrap_or(1);
            let next = ctx.get("count").and_then(Value::as_i64).unwrap_or(0) + by;
            ctx.set("count", json!(next));
            Ok(json!({"count": next}))
        })
        .action("read", |ctx, _| Ok(ctx.get("count").cloned().unwrap_or(Value::Null)))
        .build()
}

/// Requires the audit service; withdrawals beyond the balance fail.
pub fn wallet() -> ComponentDefinition {
    ComponentDefinition::builder("Wallet")
        .initial_state(json!({"balance": 100}))
        .depends_on("audit_log", true)
        .action("deposit", |ctx, payload| {
            let amount = payload.get("amount").and_then(Value::as_i64).context("amount is required")?;
            let balance = ctx.get("balance").and_then(Value::as_i64).unwrap_or(0) + amount;
            ctx.set("balance", json!(balance));
            if let Some(audit) = ctx.service::<AuditLogHandle>("audit_log") {
                audit.0.record(format!("deposit {}", amount));
            }
            Ok(json!({"balance": balance}))
        })
        .action("withdraw", |ctx, payload| {
            let amount = payload.get("amount").and_then(Value::as_i64).context("amount is required")?;
            let balance = ctx.get("balance").and_then(Value::as_i64).unwrap_or(0);
            if amount > balance {
                bail!("insufficient funds: balance {}, requested {}", balance, amount);
            }
            ctx.set("balance", json!(balance - amount));
            Ok(json!({"balance": balance - amount}))
        })
        .build()
}

pub fn flaky() -> ComponentDefinition {
    ComponentDefinition::builder("Flaky")
        .initial_state(json!({"attempts": 0}))
        .action("fail", |_, _| bail!("always fails"))
        .build()
}

/// Joins its mount room and echoes `say` to the other members.
pub fn room_member() -> ComponentDefinition {
    ComponentDefinition::builder("RoomMember")
        .initial_state(json!({"said": 0}))
        .action("say", |ctx, payload| {
            let said = ctx.get("said").and_then(Value::as_i64).unwrap_or(0) + 1;
            ctx.set("said", json!(said));
            ctx.broadcast("said", payload.clone());
            Ok(json!({"said": said}))
        })
        .build()
}
