//! # Wire Protocol
//!
//! JSON text frames exchanged over the component socket. Client frames carry
//! a `type` plus whichever fields that type needs; server frames always carry
//! `type` and `timestamp` and echo the client's `requestId`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::{LiveError, LiveResult};
use crate::utils::now_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessageType {
    ComponentMount,
    ComponentRehydrate,
    ComponentUnmount,
    CallAction,
    PropertyUpdate,
    ComponentPing,
    FileUploadStart,
    FileUploadChunk,
    FileUploadComplete,
    #[serde(other)]
    Unknown,
}

/// # Client Message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMessage {
    #[serde(rename = "type")]
    pub kind: ClientMessageType,
    #[serde(default)]
    pub component_id: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub room: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub expect_response: bool,
    #[serde(default)]
    pub upload_id: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub file_type: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub chunk_size: Option<u64>,
    #[serde(default)]
    pub chunk_index: Option<u32>,
    #[serde(default)]
    pub total_chunks: Option<u32>,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
}

impl ClientMessage {
    pub fn parse(raw: &str) -> LiveResult<Self> {
        serde_json::from_str(raw).map_err(|e| LiveError::InvalidMessage(e.to_string()))
    }

    /// `componentId`, or `InvalidMessage` naming the missing field.
    pub fn require_component_id(&self) -> LiveResult<&str> {
        self.component_id
            .as_deref()
            .ok_or_else(|| LiveError::InvalidMessage("missing field 'componentId'".to_string()))
    }

    pub fn require_upload_id(&self) -> LiveResult<&str> {
        self.upload_id
            .as_deref()
            .ok_or_else(|| LiveError::InvalidMessage("missing field 'uploadId'".to_string()))
    }

    /// A string field of `payload`.
    pub fn payload_str(&self, field: &str) -> LiveResult<&str> {
        self.payload
            .as_ref()
            .and_then(|p| p.get(field))
            .and_then(Value::as_str)
            .ok_or_else(|| LiveError::InvalidMessage(format!("missing payload field '{}'", field)))
    }

    pub fn payload_field(&self, field: &str) -> Option<&Value> {
        self.payload.as_ref().and_then(|p| p.get(field))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessageType {
    ComponentMounted,
    ComponentRehydrated,
    ComponentUnmounted,
    ActionResponse,
    MessageResponse,
    PropertyUpdated,
    ComponentPong,
    StateUpdate,
    StateRehydrated,
    FileUploadProgress,
    FileUploadComplete,
    Error,
    Broadcast,
}

/// # Server Message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub kind: ServerMessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    pub timestamp: i64,
}

impl ServerMessage {
    pub fn new(kind: ServerMessageType) -> Self {
        Self {
            kind,
            component_id: None,
            request_id: None,
            success: None,
            result: None,
            payload: None,
            error: None,
            error_code: None,
            upload_id: None,
            room: None,
            timestamp: now_millis(),
        }
    }

    pub fn component(mut self, component_id: impl Into<String>) -> Self {
        self.component_id = Some(component_id.into());
        self
    }

    pub fn request(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn success(mut self, success: bool) -> Self {
        self.success = Some(success);
        self
    }

    pub fn result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn upload(mut self, upload_id: impl Into<String>) -> Self {
        self.upload_id = Some(upload_id.into());
        self
    }

    pub fn room(mut self, room: impl Into<String>) -> Self {
        self.room = Some(room.into());
        self
    }

    /// Marks the reply failed with the error's message and wire code.
    pub fn failure(mut self, err: &LiveError) -> Self {
        self.success = Some(false);
        self.error = Some(err.to_string());
        self.error_code = Some(err.code().to_string());
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                r#"{{"type":"ERROR","error":"serialization failed: {}","errorCode":"INTERNAL_ERROR","timestamp":{}}}"#,
                e.to_string().replace('"', "'"),
                self.timestamp
            )
        })
    }
}
