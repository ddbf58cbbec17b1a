//! # Protocol Dispatcher
//!
//! Stateless switch from one inbound frame to one registry or upload call.
//! Every outcome becomes a reply correlated by `requestId`; nothing escapes as
//! an error. Request failures come back as the request's own reply type with
//! `success: false`; frames that cannot be understood come back as `ERROR`.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::core::error::{LiveError, LiveResult};
use crate::core::protocol::{ClientMessage, ClientMessageType, ServerMessage, ServerMessageType};
use crate::core::registry::{ComponentRegistry, MountOptions, RehydrateFailure, RehydrateResult};
use crate::core::signature::SignedState;
use crate::core::uploads::{ChunkOutcome, UploadManager, UploadStart};

pub struct ProtocolDispatcher {
    registry: Arc<ComponentRegistry>,
    uploads: Arc<UploadManager>,
}

impl ProtocolDispatcher {
    pub fn new(registry: Arc<ComponentRegistry>, uploads: Arc<UploadManager>) -> Self {
        Self { registry, uploads }
    }

    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    pub fn uploads(&self) -> &Arc<UploadManager> {
        &self.uploads
    }

    /// Handles one raw text frame from `connection_id` and returns the replies.
    pub async fn handle(&self, connection_id: &str, raw: &str) -> Vec<ServerMessage> {
        self.registry.connections().record_inbound(connection_id, raw.len());

        let msg = match ClientMessage::parse(raw) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(connection_id, "malformed frame: {}", e);
                return vec![ServerMessage::new(ServerMessageType::Error).failure(&e)];
            }
        };

        if let Some(component_id) = &msg.component_id {
            if self.registry.owner_of(component_id).as_deref() == Some(connection_id) {
                self.registry
                    .monitor()
                    .record_message_received(component_id, raw.len(), None);
            }
        }
        debug!(connection_id, kind = ?msg.kind, request_id = ?msg.request_id, "frame received");

        match msg.kind {
            ClientMessageType::ComponentMount => vec![self.mount(connection_id, &msg)],
            ClientMessageType::ComponentRehydrate => vec![self.rehydrate(connection_id, &msg)],
            ClientMessageType::ComponentUnmount => vec![self.unmount(connection_id, &msg)],
            ClientMessageType::CallAction => vec![self.call_action(connection_id, &msg)],
            ClientMessageType::PropertyUpdate => vec![self.property_update(connection_id, &msg)],
            ClientMessageType::ComponentPing => vec![self.ping(connection_id, &msg)],
            ClientMessageType::FileUploadStart => vec![self.upload_start(&msg)],
            ClientMessageType::FileUploadChunk => vec![self.upload_chunk(&msg).await],
            ClientMessageType::FileUploadComplete => vec![self.upload_complete(&msg).await],
            ClientMessageType::Unknown => {
                let err = LiveError::InvalidMessage("unknown message type".to_string());
                vec![reply(ServerMessageType::Error, &msg).failure(&err)]
            }
        }
    }

    fn mount(&self, connection_id: &str, msg: &ClientMessage) -> ServerMessage {
        let base = reply(ServerMessageType::ComponentMounted, msg);
        match self.try_mount(connection_id, msg) {
            Ok((component_id, result)) => base.component(component_id).success(true).result(result),
            Err(e) => base.failure(&e),
        }
    }

    fn try_mount(&self, connection_id: &str, msg: &ClientMessage) -> LiveResult<(String, Value)> {
        let name = msg.payload_str("component")?;
        let props = msg.payload_field("props").cloned().unwrap_or_else(|| json!({}));
        let options = MountOptions {
            room: msg.room.clone(),
            user_id: msg.user_id.clone(),
            version: None,
        };
        let mounted = self.registry.mount(connection_id, name, &props, options)?;
        Ok((mounted.component_id.clone(), json!(mounted)))
    }

    fn rehydrate(&self, connection_id: &str, msg: &ClientMessage) -> ServerMessage {
        let base = reply(ServerMessageType::ComponentRehydrated, msg);
        match self.try_rehydrate(connection_id, msg) {
            Ok(result) if result.success => {
                let new_id = result.new_component_id.clone().unwrap_or_default();
                base.component(new_id).success(true).result(json!(result))
            }
            Ok(result) => {
                let old_id = msg.component_id.as_deref().unwrap_or_default();
                let err = result
                    .reason
                    .unwrap_or(RehydrateFailure::Tampered)
                    .into_error(old_id, result.error.unwrap_or_default());
                base.failure(&err)
            }
            Err(e) => base.failure(&e),
        }
    }

    fn try_rehydrate(&self, connection_id: &str, msg: &ClientMessage) -> LiveResult<RehydrateResult> {
        let old_id = msg.require_component_id()?;
        let name = msg.payload_str("componentName")?;
        let raw_envelope = msg
            .payload_field("signedState")
            .cloned()
            .ok_or_else(|| LiveError::InvalidMessage("missing payload field 'signedState'".to_string()))?;
        let envelope: SignedState = serde_json::from_value(raw_envelope)
            .map_err(|e| LiveError::InvalidMessage(format!("signedState: {}", e)))?;
        let options = MountOptions {
            room: msg.room.clone(),
            user_id: msg.user_id.clone(),
            version: None,
        };
        self.registry.rehydrate(old_id, name, &envelope, connection_id, options)
    }

    fn unmount(&self, connection_id: &str, msg: &ClientMessage) -> ServerMessage {
        let base = reply(ServerMessageType::ComponentUnmounted, msg);
        match msg.require_component_id() {
            Ok(id) => {
                // Another connection's component looks already gone.
                let removed = self.registry.ensure_owner(connection_id, id).is_ok() && self.registry.unmount(id);
                base.success(true).result(json!({ "removed": removed }))
            }
            Err(e) => base.failure(&e),
        }
    }

    fn call_action(&self, connection_id: &str, msg: &ClientMessage) -> ServerMessage {
        let kind = if msg.expect_response {
            ServerMessageType::MessageResponse
        } else {
            ServerMessageType::ActionResponse
        };
        let base = reply(kind, msg);
        match self.try_call_action(connection_id, msg) {
            Ok(result) => base.success(true).result(result),
            Err(e) => {
                if e.is_rehydration_required() {
                    debug!(component_id = ?msg.component_id, "action on missing component, client must rehydrate");
                }
                base.failure(&e)
            }
        }
    }

    fn try_call_action(&self, connection_id: &str, msg: &ClientMessage) -> LiveResult<Value> {
        let id = msg.require_component_id()?;
        self.registry.ensure_owner(connection_id, id)?;
        let action = msg.action.as_deref().ok_or_else(|| missing("action"))?;
        let payload = msg.payload.clone().unwrap_or(Value::Null);
        self.registry.execute_action(id, action, payload)
    }

    fn property_update(&self, connection_id: &str, msg: &ClientMessage) -> ServerMessage {
        let base = reply(ServerMessageType::PropertyUpdated, msg);
        match self.try_property_update(connection_id, msg) {
            Ok(state) => base.success(true).result(state),
            Err(e) => base.failure(&e),
        }
    }

    fn try_property_update(&self, connection_id: &str, msg: &ClientMessage) -> LiveResult<Value> {
        let id = msg.require_component_id()?;
        self.registry.ensure_owner(connection_id, id)?;
        let property = msg.payload_str("property")?;
        let value = msg.payload_field("value").cloned().unwrap_or(Value::Null);
        self.registry.update_property(id, property, value)
    }

    fn ping(&self, connection_id: &str, msg: &ClientMessage) -> ServerMessage {
        let base = reply(ServerMessageType::ComponentPong, msg);
        match msg.component_id.as_deref() {
            Some(id) => {
                let alive = self.registry.ensure_owner(connection_id, id).is_ok() && self.registry.touch(id);
                if alive {
                    self.registry.monitor().record_interaction(id, "ping");
                }
                base.success(alive).result(json!({ "alive": alive }))
            }
            None => base.success(true),
        }
    }

    fn upload_start(&self, msg: &ClientMessage) -> ServerMessage {
        let base = reply(ServerMessageType::FileUploadProgress, msg);
        match self.try_upload_start(msg) {
            Ok(progress) => base.success(true).payload(progress),
            Err(e) => base.failure(&e),
        }
    }

    fn try_upload_start(&self, msg: &ClientMessage) -> LiveResult<Value> {
        let meta = UploadStart {
            upload_id: msg.require_upload_id()?.to_string(),
            component_id: msg.require_component_id()?.to_string(),
            filename: msg.filename.clone().ok_or_else(|| missing("filename"))?,
            file_type: msg.file_type.clone().ok_or_else(|| missing("fileType"))?,
            file_size: msg.file_size.ok_or_else(|| missing("fileSize"))?,
            chunk_size: msg.chunk_size.ok_or_else(|| missing("chunkSize"))?,
        };
        let progress = self.uploads.start(meta)?;
        Ok(json!(progress))
    }

    async fn upload_chunk(&self, msg: &ClientMessage) -> ServerMessage {
        match self.try_upload_chunk(msg).await {
            Ok(ChunkOutcome::Progress(progress)) => reply(ServerMessageType::FileUploadProgress, msg)
                .success(true)
                .payload(json!(progress)),
            Ok(ChunkOutcome::Completed(done)) => reply(ServerMessageType::FileUploadComplete, msg)
                .success(true)
                .payload(json!(done)),
            Err(e) => reply(ServerMessageType::FileUploadProgress, msg).failure(&e),
        }
    }

    async fn try_upload_chunk(&self, msg: &ClientMessage) -> LiveResult<ChunkOutcome> {
        let upload_id = msg.require_upload_id()?;
        let index = msg.chunk_index.ok_or_else(|| missing("chunkIndex"))?;
        let total = msg.total_chunks.ok_or_else(|| missing("totalChunks"))?;
        let data = msg.data.as_deref().ok_or_else(|| missing("data"))?;
        let outcome = self
            .uploads
            .receive_chunk(upload_id, index, total, data, msg.hash.as_deref())
            .await?;
        Ok(outcome)
    }

    async fn upload_complete(&self, msg: &ClientMessage) -> ServerMessage {
        let base = reply(ServerMessageType::FileUploadComplete, msg);
        let upload_id = match msg.require_upload_id() {
            Ok(id) => id,
            Err(e) => return base.failure(&e),
        };
        match self.uploads.complete(upload_id).await {
            Ok(done) => base.success(true).payload(json!(done)),
            Err(e) => base.failure(&LiveError::from(e)),
        }
    }
}

fn missing(field: &str) -> LiveError {
    LiveError::InvalidMessage(format!("missing field '{}'", field))
}

/// Reply skeleton echoing the request's correlation fields.
fn reply(kind: ServerMessageType, msg: &ClientMessage) -> ServerMessage {
    let mut out = ServerMessage::new(kind).request(msg.request_id.clone());
    if let Some(id) = &msg.component_id {
        out = out.component(id.clone());
    }
    if let Some(upload_id) = &msg.upload_id {
        out = out.upload(upload_id.clone());
    }
    out
}
