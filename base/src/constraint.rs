//! Constraint validation for widget values.
//!
//! Pure functions only: the coordinator and the client both call these so the
//! validation rules can't drift between tiers.
//!
//! - [`derive_constraints`] turns a widget type and its properties into a
//!   [`ConstraintDescriptor`].
//! - [`validate`] checks a value against a descriptor.
//! - [`auto_fix`] repairs what can be repaired (clamp, snap, drop invalid
//!   entries, truncate). It is idempotent.
//! - [`normalize`] is `auto_fix` followed by `validate`, the pipeline run on
//!   every commit.

use crate::widget::{ValueKind, WidgetProperties, WidgetType, WidgetValue};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_SLIDER_MIN: f64 = 0.0;
const DEFAULT_SLIDER_MAX: f64 = 100.0;
const DEFAULT_SLIDER_STEP: f64 = 1.0;
/// digits kept when tidying snapped values
const MAX_DECIMALS: i32 = 12;

/// Why a value was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct ConstraintViolation {
    pub reason: String,
}

impl ConstraintViolation {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Numeric bounds; `step` snaps relative to `min` (or 0 when unbounded).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NumericBounds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
}

impl NumericBounds {
    fn sanitized(min: Option<f64>, max: Option<f64>, step: Option<f64>) -> Self {
        let min = min.filter(|v| v.is_finite());
        let max = max.filter(|v| v.is_finite());
        let (min, max) = match (min, max) {
            (Some(a), Some(b)) if a > b => (Some(b), Some(a)),
            other => other,
        };
        let step = step.filter(|s| s.is_finite() && *s > 0.0);
        Self { min, max, step }
    }

    fn origin(&self) -> f64 {
        self.min.unwrap_or(0.0)
    }

    /// Clamp into `[min, max]`, then snap to the nearest step multiple.
    /// Exact ties go toward `min`; a snapped value above `max` moves down a step.
    fn fit(&self, v: f64) -> f64 {
        let mut x = v;
        if let Some(max) = self.max {
            x = x.min(max);
        }
        if let Some(min) = self.min {
            x = x.max(min);
        }
        let Some(step) = self.step else {
            return x;
        };
        let origin = self.origin();
        let mut k = ((x - origin) / step - 0.5).ceil();
        if let Some(max) = self.max {
            if origin + k * step > max + tolerance(max) {
                k -= 1.0;
            }
        }
        if let Some(min) = self.min {
            if origin + k * step < min - tolerance(min) {
                k += 1.0;
            }
        }
        self.tidy(origin + k * step)
    }

    /// Round away float noise (`0.30000000000000004`) to the precision the
    /// bounds are declared with.
    fn tidy(&self, v: f64) -> f64 {
        let decimals = [self.step, self.min]
            .iter()
            .flatten()
            .map(|x| decimals_of(*x))
            .max()
            .unwrap_or(0);
        let factor = 10f64.powi(decimals);
        let rounded = (v * factor).round() / factor;
        if rounded.is_finite() {
            rounded
        } else {
            v
        }
    }

    fn check(&self, v: f64) -> Result<(), ConstraintViolation> {
        if !v.is_finite() {
            return Err(ConstraintViolation::new(format!("{} is not a finite number", v)));
        }
        if let Some(min) = self.min {
            if v < min - tolerance(min) {
                return Err(ConstraintViolation::new(format!("{} is below min {}", v, min)));
            }
        }
        if let Some(max) = self.max {
            if v > max + tolerance(max) {
                return Err(ConstraintViolation::new(format!("{} is above max {}", v, max)));
            }
        }
        if let Some(step) = self.step {
            let steps = (v - self.origin()) / step;
            if (steps - steps.round()).abs() * step > tolerance(v) {
                return Err(ConstraintViolation::new(format!(
                    "{} is not a multiple of step {} from {}",
                    v,
                    step,
                    self.origin()
                )));
            }
        }
        Ok(())
    }
}

fn tolerance(reference: f64) -> f64 {
    1e-9 * reference.abs().max(1.0)
}

fn decimals_of(x: f64) -> i32 {
    let repr = format!("{}", x);
    if repr.contains('e') {
        return MAX_DECIMALS;
    }
    repr.split_once('.')
        .map(|(_, frac)| (frac.len() as i32).min(MAX_DECIMALS))
        .unwrap_or(0)
}

/// Derived validation rule set for a widget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "camelCase")]
pub enum ConstraintDescriptor {
    Numeric(NumericBounds),
    Range(NumericBounds),
    #[serde(rename_all = "camelCase")]
    Choice { options: Vec<String> },
    #[serde(rename_all = "camelCase")]
    MultiChoice {
        options: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_selections: Option<usize>,
    },
    #[serde(rename_all = "camelCase")]
    Text {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_length: Option<usize>,
    },
    Toggle,
    #[serde(rename_all = "camelCase")]
    Action {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        actions: Option<Vec<String>>,
    },
    #[serde(rename_all = "camelCase")]
    Rows {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        row_ids: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_selections: Option<usize>,
    },
    Payload,
}

impl ConstraintDescriptor {
    pub fn value_kind(&self) -> ValueKind {
        match self {
            ConstraintDescriptor::Numeric(_) => ValueKind::Number,
            ConstraintDescriptor::Range(_) => ValueKind::Range,
            ConstraintDescriptor::Choice { .. } | ConstraintDescriptor::Text { .. } => {
                ValueKind::Text
            }
            ConstraintDescriptor::MultiChoice { .. } | ConstraintDescriptor::Rows { .. } => {
                ValueKind::Selection
            }
            ConstraintDescriptor::Toggle => ValueKind::Bool,
            ConstraintDescriptor::Action { .. } => ValueKind::Action,
            ConstraintDescriptor::Payload => ValueKind::Json,
        }
    }
}

pub fn derive_constraints(
    widget_type: WidgetType,
    properties: &WidgetProperties,
) -> ConstraintDescriptor {
    match widget_type {
        WidgetType::Slider => ConstraintDescriptor::Numeric(NumericBounds::sanitized(
            Some(properties.min.unwrap_or(DEFAULT_SLIDER_MIN)),
            Some(properties.max.unwrap_or(DEFAULT_SLIDER_MAX)),
            Some(properties.step.unwrap_or(DEFAULT_SLIDER_STEP)),
        )),
        WidgetType::Number => ConstraintDescriptor::Numeric(NumericBounds::sanitized(
            properties.min,
            properties.max,
            properties.step,
        )),
        WidgetType::Range => ConstraintDescriptor::Range(NumericBounds::sanitized(
            Some(properties.min.unwrap_or(DEFAULT_SLIDER_MIN)),
            Some(properties.max.unwrap_or(DEFAULT_SLIDER_MAX)),
            Some(properties.step.unwrap_or(DEFAULT_SLIDER_STEP)),
        )),
        WidgetType::Dropdown | WidgetType::Radio => ConstraintDescriptor::Choice {
            options: properties.options.clone().unwrap_or_default(),
        },
        WidgetType::Multiselect => ConstraintDescriptor::MultiChoice {
            options: properties.options.clone().unwrap_or_default(),
            max_selections: properties.max_selections,
        },
        WidgetType::Text | WidgetType::Textarea => ConstraintDescriptor::Text {
            max_length: properties.max_length,
        },
        WidgetType::Switch => ConstraintDescriptor::Toggle,
        WidgetType::Button => ConstraintDescriptor::Action {
            actions: properties.actions.clone(),
        },
        WidgetType::Table => ConstraintDescriptor::Rows {
            row_ids: properties.row_ids.clone(),
            max_selections: properties.max_selections,
        },
        WidgetType::Chart => ConstraintDescriptor::Payload,
    }
}

pub fn validate(
    descriptor: &ConstraintDescriptor,
    value: &WidgetValue,
) -> Result<(), ConstraintViolation> {
    match (descriptor, value) {
        (ConstraintDescriptor::Numeric(bounds), WidgetValue::Number(n)) => bounds.check(*n),
        (ConstraintDescriptor::Range(bounds), WidgetValue::Range([lo, hi])) => {
            bounds.check(*lo)?;
            bounds.check(*hi)?;
            if lo > hi {
                return Err(ConstraintViolation::new(format!(
                    "range start {} is after end {}",
                    lo, hi
                )));
            }
            Ok(())
        }
        (ConstraintDescriptor::Choice { options }, WidgetValue::Text(s)) => {
            if options.contains(s) {
                Ok(())
            } else {
                Err(ConstraintViolation::new(format!(
                    "'{}' is not one of {:?}",
                    s, options
                )))
            }
        }
        (
            ConstraintDescriptor::MultiChoice {
                options,
                max_selections,
            },
            WidgetValue::Selection(items),
        ) => check_selection(items, Some(options), *max_selections),
        (
            ConstraintDescriptor::Rows {
                row_ids,
                max_selections,
            },
            WidgetValue::Selection(items),
        ) => check_selection(items, row_ids.as_ref(), *max_selections),
        (ConstraintDescriptor::Text { max_length }, WidgetValue::Text(s)) => match max_length {
            Some(max) if s.chars().count() > *max => Err(ConstraintViolation::new(format!(
                "text length {} exceeds max {}",
                s.chars().count(),
                max
            ))),
            _ => Ok(()),
        },
        (ConstraintDescriptor::Toggle, WidgetValue::Bool(_)) => Ok(()),
        (ConstraintDescriptor::Action { actions }, WidgetValue::Action(action)) => {
            if action.action.is_empty() {
                return Err(ConstraintViolation::new("empty button action"));
            }
            match actions {
                Some(allowed) if !allowed.contains(&action.action) => {
                    Err(ConstraintViolation::new(format!(
                        "action '{}' is not one of {:?}",
                        action.action, allowed
                    )))
                }
                _ => Ok(()),
            }
        }
        (ConstraintDescriptor::Payload, WidgetValue::Json(_)) => Ok(()),
        (d, v) => Err(ConstraintViolation::new(format!(
            "expected {} value, got {}",
            d.value_kind(),
            v.kind()
        ))),
    }
}

fn check_selection(
    items: &[String],
    allowed: Option<&Vec<String>>,
    max_selections: Option<usize>,
) -> Result<(), ConstraintViolation> {
    if let Some(allowed) = allowed {
        if let Some(bad) = items.iter().find(|i| !allowed.contains(i)) {
            return Err(ConstraintViolation::new(format!(
                "'{}' is not one of {:?}",
                bad, allowed
            )));
        }
    }
    for (i, item) in items.iter().enumerate() {
        if items[..i].contains(item) {
            return Err(ConstraintViolation::new(format!(
                "'{}' is selected twice",
                item
            )));
        }
    }
    match max_selections {
        Some(max) if items.len() > max => Err(ConstraintViolation::new(format!(
            "{} selections exceed max {}",
            items.len(),
            max
        ))),
        _ => Ok(()),
    }
}

fn repair_selection(
    items: &[String],
    allowed: Option<&Vec<String>>,
    max_selections: Option<usize>,
) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        let permitted = allowed.map(|a| a.contains(item)).unwrap_or(true);
        if permitted && !out.contains(item) {
            out.push(item.clone());
        }
    }
    if let Some(max) = max_selections {
        out.truncate(max);
    }
    out
}

/// Repair a value where possible. Values of the wrong shape, non-finite
/// numbers and unknown button actions are returned unchanged so that
/// [`validate`] rejects them: nothing is coerced.
pub fn auto_fix(descriptor: &ConstraintDescriptor, value: &WidgetValue) -> WidgetValue {
    match (descriptor, value) {
        (ConstraintDescriptor::Numeric(bounds), WidgetValue::Number(n)) if n.is_finite() => {
            WidgetValue::Number(bounds.fit(*n))
        }
        (ConstraintDescriptor::Range(bounds), WidgetValue::Range([a, b]))
            if a.is_finite() && b.is_finite() =>
        {
            let (lo, hi) = if a <= b { (*a, *b) } else { (*b, *a) };
            WidgetValue::Range([bounds.fit(lo), bounds.fit(hi)])
        }
        (ConstraintDescriptor::Choice { options }, WidgetValue::Text(s)) => {
            if options.contains(s) {
                value.clone()
            } else {
                options
                    .first()
                    .map(|first| WidgetValue::Text(first.clone()))
                    .unwrap_or_else(|| value.clone())
            }
        }
        (
            ConstraintDescriptor::MultiChoice {
                options,
                max_selections,
            },
            WidgetValue::Selection(items),
        ) => WidgetValue::Selection(repair_selection(items, Some(options), *max_selections)),
        (
            ConstraintDescriptor::Rows {
                row_ids,
                max_selections,
            },
            WidgetValue::Selection(items),
        ) => WidgetValue::Selection(repair_selection(items, row_ids.as_ref(), *max_selections)),
        (
            ConstraintDescriptor::Text {
                max_length: Some(max),
            },
            WidgetValue::Text(s),
        ) if s.chars().count() > *max => WidgetValue::Text(s.chars().take(*max).collect()),
        _ => value.clone(),
    }
}

/// `auto_fix` then `validate`; the value to commit.
pub fn normalize(
    descriptor: &ConstraintDescriptor,
    value: &WidgetValue,
) -> Result<WidgetValue, ConstraintViolation> {
    let fixed = auto_fix(descriptor, value);
    validate(descriptor, &fixed)?;
    Ok(fixed)
}
