//! String codec for values crossing the execution-engine boundary.
//!
//! Scalars travel as their plain text form; composite values (ranges,
//! selections, button actions, chart payloads) are JSON encoded.

use crate::error::LiveError;
use crate::widget::{ButtonAction, ValueKind, WidgetType, WidgetValue};
use anyhow::Result;

pub trait UseValueCodec {
    fn encode_value(value: &WidgetValue) -> Result<String> {
        let encoded = match value {
            WidgetValue::Number(n) => format!("{}", n),
            WidgetValue::Text(s) => s.clone(),
            WidgetValue::Bool(b) => b.to_string(),
            WidgetValue::Range(r) => serde_json::to_string(r).map_err(LiveError::from)?,
            WidgetValue::Selection(items) => {
                serde_json::to_string(items).map_err(LiveError::from)?
            }
            WidgetValue::Action(action) => {
                serde_json::to_string(action).map_err(LiveError::from)?
            }
            WidgetValue::Json(v) => serde_json::to_string(v).map_err(LiveError::from)?,
        };
        Ok(encoded)
    }

    fn decode_value(widget_type: WidgetType, raw: &str) -> Result<WidgetValue> {
        let codec_err = |e: &dyn std::fmt::Display| {
            LiveError::CodecError(format!(
                "cannot decode '{}' as {:?}: {}",
                raw, widget_type, e
            ))
        };
        let value = match widget_type.value_kind() {
            ValueKind::Number => WidgetValue::Number(
                raw.trim()
                    .parse::<f64>()
                    .map_err(|e| codec_err(&e))?,
            ),
            ValueKind::Text => WidgetValue::Text(raw.to_string()),
            ValueKind::Bool => {
                WidgetValue::Bool(raw.trim().parse::<bool>().map_err(|e| codec_err(&e))?)
            }
            ValueKind::Range => WidgetValue::Range(
                serde_json::from_str::<[f64; 2]>(raw).map_err(|e| codec_err(&e))?,
            ),
            ValueKind::Selection => WidgetValue::Selection(
                serde_json::from_str::<Vec<String>>(raw).map_err(|e| codec_err(&e))?,
            ),
            ValueKind::Action => WidgetValue::Action(
                serde_json::from_str::<ButtonAction>(raw).map_err(|e| codec_err(&e))?,
            ),
            ValueKind::Json => WidgetValue::Json(
                serde_json::from_str::<serde_json::Value>(raw).map_err(|e| codec_err(&e))?,
            ),
        };
        Ok(value)
    }

    /// Engine outputs are strings that may hold JSON; anything else stays text.
    fn decode_output(raw: &str) -> serde_json::Value {
        serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
    }
}

pub struct ValueCodec;
impl UseValueCodec for ValueCodec {}
