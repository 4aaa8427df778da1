//! Local cache of the session's widgets.
//!
//! Written only by the update pipeline and by inbound collaboration events.
//! The displayed `value` may run ahead of `committed_value` during
//! interaction; `committed_value` is the last value the coordinator accepted.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use infra::infra::persistence::PersistedWidget;
use livecell_base::constraint::ConstraintDescriptor;
use livecell_base::error::{ErrorKind, LiveError};
use livecell_base::protocol::UpdateOutcome;
use livecell_base::widget::{
    SessionId, WidgetId, WidgetLock, WidgetProperties, WidgetRecord, WidgetType, WidgetValue,
};
use serde::Serialize;

/// Error shown next to a widget after a failed commit.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetStatus {
    pub kind: ErrorKind,
    pub message: String,
}

impl WidgetStatus {
    pub fn from_error(err: &anyhow::Error) -> Self {
        Self {
            kind: LiveError::classify(err),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientWidget {
    pub widget_id: WidgetId,
    pub widget_type: WidgetType,
    pub value: WidgetValue,
    pub committed_value: WidgetValue,
    pub properties: WidgetProperties,
    pub constraints: ConstraintDescriptor,
    pub version: u64,
    pub last_updated: DateTime<Utc>,
    pub lock: Option<WidgetLock>,
    pub is_loading: bool,
    pub error: Option<WidgetStatus>,
}

impl From<WidgetRecord> for ClientWidget {
    fn from(r: WidgetRecord) -> Self {
        Self {
            widget_id: r.widget_id,
            widget_type: r.widget_type,
            committed_value: r.value.clone(),
            value: r.value,
            properties: r.properties,
            constraints: r.constraints,
            version: r.version,
            last_updated: r.last_updated,
            lock: r.lock,
            is_loading: false,
            error: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct WidgetRegistry {
    widgets: DashMap<WidgetId, ClientWidget>,
}

impl WidgetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the local copy with the coordinator's record.
    pub fn upsert(&self, record: WidgetRecord) -> ClientWidget {
        let widget = ClientWidget::from(record);
        self.widgets.insert(widget.widget_id.clone(), widget.clone());
        widget
    }

    pub fn get(&self, widget_id: &WidgetId) -> Option<ClientWidget> {
        self.widgets.get(widget_id).map(|w| w.value().clone())
    }

    pub fn all(&self) -> Vec<ClientWidget> {
        let mut all: Vec<ClientWidget> = self.widgets.iter().map(|w| w.value().clone()).collect();
        all.sort_by(|a, b| a.widget_id.cmp(&b.widget_id));
        all
    }

    pub fn len(&self) -> usize {
        self.widgets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.widgets.is_empty()
    }

    fn not_found(widget_id: &WidgetId) -> LiveError {
        LiveError::NotFound(format!("widget {} is not registered", widget_id))
    }

    /// Optimistic local change; nothing is validated or sent.
    pub fn apply_local(&self, widget_id: &WidgetId, value: WidgetValue) -> Result<(), LiveError> {
        let mut w = self
            .widgets
            .get_mut(widget_id)
            .ok_or_else(|| Self::not_found(widget_id))?;
        w.value = value;
        w.error = None;
        Ok(())
    }

    pub fn set_loading(&self, widget_id: &WidgetId, loading: bool) {
        if let Some(mut w) = self.widgets.get_mut(widget_id) {
            w.is_loading = loading;
        }
    }

    /// Record an accepted commit. With `keep_display` the displayed value is
    /// left alone because newer local input is pending.
    pub fn apply_commit(&self, outcome: &UpdateOutcome, keep_display: bool) {
        if let Some(mut w) = self.widgets.get_mut(&outcome.widget_id) {
            if outcome.version >= w.version {
                w.committed_value = outcome.value.clone();
                w.version = outcome.version;
                w.last_updated = Utc::now();
            }
            if !keep_display {
                w.value = w.committed_value.clone();
            }
            w.is_loading = false;
            w.error = None;
        }
    }

    /// Apply a commit made elsewhere. Ignored unless newer than what we hold.
    pub fn apply_remote(
        &self,
        widget_id: &WidgetId,
        value: WidgetValue,
        version: u64,
        updated_at: DateTime<Utc>,
        keep_display: bool,
    ) -> bool {
        match self.widgets.get_mut(widget_id) {
            Some(mut w) if version > w.version => {
                w.committed_value = value.clone();
                w.version = version;
                w.last_updated = updated_at;
                if !keep_display {
                    w.value = value;
                }
                true
            }
            _ => false,
        }
    }

    /// Failed commit: show the last known good value and the error.
    pub fn fail(&self, widget_id: &WidgetId, status: WidgetStatus) {
        if let Some(mut w) = self.widgets.get_mut(widget_id) {
            w.value = w.committed_value.clone();
            w.is_loading = false;
            w.error = Some(status);
        }
    }

    pub fn set_lock(&self, widget_id: &WidgetId, lock: Option<WidgetLock>) {
        if let Some(mut w) = self.widgets.get_mut(widget_id) {
            w.lock = lock;
        }
    }

    pub fn remove(&self, widget_id: &WidgetId) -> bool {
        self.widgets.remove(widget_id).is_some()
    }

    pub fn clear(&self) {
        self.widgets.clear();
    }

    /// Committed state of every widget, in the persisted shape.
    pub fn snapshot(&self, session_id: &SessionId) -> Vec<PersistedWidget> {
        self.widgets
            .iter()
            .map(|w| PersistedWidget {
                session_id: session_id.clone(),
                widget_id: w.widget_id.clone(),
                widget_type: w.widget_type,
                value: w.committed_value.clone(),
                properties: w.properties.clone(),
                version: w.version,
                last_updated: w.last_updated,
            })
            .collect()
    }
}
