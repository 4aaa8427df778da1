//! Widget data model shared by the coordinator and the client.
//!
//! A widget is identified by `(SessionId, WidgetId)`. Its value is a tagged
//! union whose variant is fixed by the widget type, see [`WidgetType::value_kind`].

use crate::constraint::ConstraintDescriptor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn random() -> Self {
                Self(format!("{}{}", $prefix, uuid::Uuid::new_v4()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Live execution context grouping a set of widgets.
    SessionId,
    "sess_"
);
string_id!(
    /// Widget identifier, unique within a session.
    WidgetId,
    "w_"
);
string_id!(
    /// Observer / editor of a session; also the lock holder identity.
    ClientId,
    "cl_"
);

/// Closed set of widget types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WidgetType {
    Slider,
    Number,
    Range,
    Dropdown,
    Radio,
    Multiselect,
    Switch,
    Text,
    Textarea,
    Button,
    Table,
    Chart,
}

impl std::str::FromStr for WidgetType {
    type Err = crate::error::LiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| crate::error::LiveError::InvalidParameter(format!("unknown widget type: {}", s)))
    }
}

/// Shape of the value carried by a widget type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Number,
    Range,
    Text,
    Bool,
    Selection,
    Action,
    Json,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValueKind::Number => "number",
            ValueKind::Range => "range",
            ValueKind::Text => "text",
            ValueKind::Bool => "bool",
            ValueKind::Selection => "selection",
            ValueKind::Action => "action",
            ValueKind::Json => "json",
        };
        f.write_str(s)
    }
}

impl WidgetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WidgetType::Slider => "slider",
            WidgetType::Number => "number",
            WidgetType::Range => "range",
            WidgetType::Dropdown => "dropdown",
            WidgetType::Radio => "radio",
            WidgetType::Multiselect => "multiselect",
            WidgetType::Switch => "switch",
            WidgetType::Text => "text",
            WidgetType::Textarea => "textarea",
            WidgetType::Button => "button",
            WidgetType::Table => "table",
            WidgetType::Chart => "chart",
        }
    }

    pub fn value_kind(&self) -> ValueKind {
        match self {
            WidgetType::Slider | WidgetType::Number => ValueKind::Number,
            WidgetType::Range => ValueKind::Range,
            WidgetType::Dropdown | WidgetType::Radio | WidgetType::Text | WidgetType::Textarea => {
                ValueKind::Text
            }
            WidgetType::Switch => ValueKind::Bool,
            WidgetType::Multiselect | WidgetType::Table => ValueKind::Selection,
            WidgetType::Button => ValueKind::Action,
            WidgetType::Chart => ValueKind::Json,
        }
    }

    /// Initial value used when a component mounts without one.
    pub fn default_value(&self, properties: &WidgetProperties) -> WidgetValue {
        match self {
            WidgetType::Slider | WidgetType::Number => {
                WidgetValue::Number(properties.min.unwrap_or(0.0))
            }
            WidgetType::Range => WidgetValue::Range([
                properties.min.unwrap_or(0.0),
                properties.max.unwrap_or(100.0),
            ]),
            WidgetType::Dropdown | WidgetType::Radio => WidgetValue::Text(
                properties
                    .options
                    .as_ref()
                    .and_then(|o| o.first().cloned())
                    .unwrap_or_default(),
            ),
            WidgetType::Text | WidgetType::Textarea => WidgetValue::Text(String::new()),
            WidgetType::Switch => WidgetValue::Bool(false),
            WidgetType::Multiselect | WidgetType::Table => WidgetValue::Selection(vec![]),
            WidgetType::Button => WidgetValue::Action(ButtonAction::new(
                properties
                    .actions
                    .as_ref()
                    .and_then(|a| a.first().cloned())
                    .unwrap_or_else(|| "idle".to_string()),
            )),
            WidgetType::Chart => WidgetValue::Json(serde_json::Value::Null),
        }
    }
}

/// Structured payload emitted by a button press.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ButtonAction {
    pub action: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

impl ButtonAction {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Widget value, one variant per value shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum WidgetValue {
    Number(f64),
    Range([f64; 2]),
    Text(String),
    Bool(bool),
    Selection(Vec<String>),
    Action(ButtonAction),
    Json(serde_json::Value),
}

impl WidgetValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            WidgetValue::Number(_) => ValueKind::Number,
            WidgetValue::Range(_) => ValueKind::Range,
            WidgetValue::Text(_) => ValueKind::Text,
            WidgetValue::Bool(_) => ValueKind::Bool,
            WidgetValue::Selection(_) => ValueKind::Selection,
            WidgetValue::Action(_) => ValueKind::Action,
            WidgetValue::Json(_) => ValueKind::Json,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            WidgetValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            WidgetValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<f64> for WidgetValue {
    fn from(n: f64) -> Self {
        WidgetValue::Number(n)
    }
}

impl From<bool> for WidgetValue {
    fn from(b: bool) -> Self {
        WidgetValue::Bool(b)
    }
}

impl From<&str> for WidgetValue {
    fn from(s: &str) -> Self {
        WidgetValue::Text(s.to_string())
    }
}

/// Declarative configuration supplied at registration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_selections: Option<usize>,
    /// allowed button actions (any when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<String>>,
    /// selectable table row keys (any when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_ids: Option<Vec<String>>,
    /// presentation-only keys, passed through untouched
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl WidgetProperties {
    pub fn bounded(min: f64, max: f64, step: f64) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
            step: Some(step),
            ..Default::default()
        }
    }

    pub fn with_options<I, S>(options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            options: Some(options.into_iter().map(Into::into).collect()),
            ..Default::default()
        }
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length: Some(max_length),
            ..Default::default()
        }
    }
}

/// Exclusive editing claim on a widget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetLock {
    pub holder_id: ClientId,
    pub acquired_at: DateTime<Utc>,
}

/// Authoritative widget record as held by the session coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetRecord {
    pub session_id: SessionId,
    pub widget_id: WidgetId,
    pub widget_type: WidgetType,
    pub value: WidgetValue,
    pub properties: WidgetProperties,
    pub constraints: ConstraintDescriptor,
    pub version: u64,
    pub last_updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<WidgetLock>,
}
