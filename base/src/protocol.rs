//! Request/response and event types shared by the coordinator, the HTTP front
//! and the client transports.

use crate::constraint::ConstraintDescriptor;
use crate::error::ErrorKind;
use crate::widget::{ClientId, SessionId, WidgetId, WidgetLock, WidgetProperties, WidgetType, WidgetValue};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ordering of items within a batch update (high first).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// sort key: lower runs earlier
    pub fn rank(&self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

/// How registration treats an already persisted or registered value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterMode {
    /// keep an existing value (idempotent mount)
    #[default]
    Keep,
    /// overwrite with the supplied value (persisted-state restore)
    Restore,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterWidgetRequest {
    pub widget_id: WidgetId,
    pub widget_type: WidgetType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<WidgetValue>,
    #[serde(default)]
    pub properties: WidgetProperties,
    #[serde(default)]
    pub mode: RegisterMode,
}

impl RegisterWidgetRequest {
    pub fn new(
        widget_id: impl Into<WidgetId>,
        widget_type: WidgetType,
        value: Option<WidgetValue>,
        properties: WidgetProperties,
    ) -> Self {
        Self {
            widget_id: widget_id.into(),
            widget_type,
            value,
            properties,
            mode: RegisterMode::Keep,
        }
    }

    pub fn restoring(mut self) -> Self {
        self.mode = RegisterMode::Restore;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateValueRequest {
    pub value: WidgetValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder_id: Option<ClientId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<u64>,
}

impl UpdateValueRequest {
    pub fn new(value: WidgetValue) -> Self {
        Self {
            value,
            holder_id: None,
            expected_version: None,
        }
    }

    pub fn from_holder(mut self, holder_id: ClientId) -> Self {
        self.holder_id = Some(holder_id);
        self
    }

    pub fn expecting(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }
}

/// Result of a committed (or no-op) value update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOutcome {
    pub widget_id: WidgetId,
    /// value after normalization, as stored
    pub value: WidgetValue,
    pub version: u64,
    /// false when the value was unchanged and nothing was committed
    pub changed: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchUpdateItem {
    pub widget_id: WidgetId,
    pub value: WidgetValue,
    #[serde(default)]
    pub priority: Priority,
}

impl BatchUpdateItem {
    pub fn new(widget_id: impl Into<WidgetId>, value: WidgetValue, priority: Priority) -> Self {
        Self {
            widget_id: widget_id.into(),
            value,
            priority,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchUpdateRequest {
    pub updates: Vec<BatchUpdateItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder_id: Option<ClientId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchFailure {
    pub id: WidgetId,
    pub reason: String,
    pub code: ErrorKind,
}

/// Partial success is a normal outcome: `failed` lists the rejected items.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchUpdateResponse {
    pub succeeded: Vec<WidgetId>,
    pub failed: Vec<BatchFailure>,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub version: u64,
    pub value: WidgetValue,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<ClientId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRequest {
    pub holder_id: ClientId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockResponse {
    pub widget_id: WidgetId,
    pub acquired: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<WidgetLock>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstraintsResponse {
    pub widget_id: WidgetId,
    pub constraints: ConstraintDescriptor,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,
    pub widget_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteCellRequest {
    pub code: String,
}

/// Reply of the execution engine to a forwarded value or an executed cell.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutput {
    #[serde(default)]
    pub outputs: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Best-effort notifications fanned out to every observer of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CollaborationEvent {
    #[serde(rename_all = "camelCase")]
    ValueCommitted {
        widget_id: WidgetId,
        value: WidgetValue,
        version: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin: Option<ClientId>,
        updated_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    LockChanged {
        widget_id: WidgetId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lock: Option<WidgetLock>,
    },
    #[serde(rename_all = "camelCase")]
    WidgetRemoved { widget_id: WidgetId },
}

impl CollaborationEvent {
    pub fn widget_id(&self) -> &WidgetId {
        match self {
            CollaborationEvent::ValueCommitted { widget_id, .. }
            | CollaborationEvent::LockChanged { widget_id, .. }
            | CollaborationEvent::WidgetRemoved { widget_id } => widget_id,
        }
    }

    /// Client that caused the event, if known.
    pub fn origin(&self) -> Option<&ClientId> {
        match self {
            CollaborationEvent::ValueCommitted { origin, .. } => origin.as_ref(),
            CollaborationEvent::LockChanged { lock, .. } => lock.as_ref().map(|l| &l.holder_id),
            CollaborationEvent::WidgetRemoved { .. } => None,
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            CollaborationEvent::ValueCommitted { .. } => "valueCommitted",
            CollaborationEvent::LockChanged { .. } => "lockChanged",
            CollaborationEvent::WidgetRemoved { .. } => "widgetRemoved",
        }
    }
}
