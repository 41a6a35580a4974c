use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SweepError};

/// A single parameter value as it appears in a case assignment.
///
/// Deserialized untagged, so YAML `3`, `3.3`, `true` and `"1k"` land in
/// the matching variant. Coercion of numeric-looking strings happens once,
/// in [`ParamValue::normalize`], during expansion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ParamValue {
    /// Interpret registry or command-line text. Integers win over floats,
    /// floats must be finite, `true`/`false` are booleans, everything else
    /// stays a string (SPICE suffixes such as `10n` included).
    pub fn parse_text(text: &str) -> Self {
        if let Ok(v) = text.parse::<i64>() {
            return ParamValue::Int(v);
        }
        if let Ok(v) = text.parse::<f64>() {
            if v.is_finite() {
                return ParamValue::Float(v);
            }
        }
        match text {
            "true" => ParamValue::Bool(true),
            "false" => ParamValue::Bool(false),
            _ => ParamValue::Str(text.to_string()),
        }
    }

    pub fn normalize(self, key: &str) -> Result<Self> {
        match self {
            ParamValue::Str(s) => Ok(ParamValue::parse_text(&s)),
            ParamValue::Float(v) if !v.is_finite() => Err(SweepError::config(
                key,
                format!("non-finite value {v} is not allowed"),
            )),
            other => Ok(other),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(v) => Some(*v as f64),
            ParamValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ParamValue::Bool(_) => "bool",
            ParamValue::Int(_) => "int",
            ParamValue::Float(_) => "float",
            ParamValue::Str(_) => "string",
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(v) => write!(f, "{v}"),
            ParamValue::Int(v) => write!(f, "{v}"),
            // keep a fractional digit so the text reads back as a float
            ParamValue::Float(v) if v.fract() == 0.0 => write!(f, "{v:.1}"),
            ParamValue::Float(v) => write!(f, "{v}"),
            ParamValue::Str(v) => f.write_str(v),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeScale {
    #[default]
    Linear,
    Log,
}

/// `start..=stop` sampled at `count` points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RangeSpec {
    pub start: f64,
    pub stop: f64,
    pub count: usize,
    #[serde(default)]
    pub scale: RangeScale,
}

impl RangeSpec {
    pub fn linear(start: f64, stop: f64, count: usize) -> Self {
        Self {
            start,
            stop,
            count,
            scale: RangeScale::Linear,
        }
    }

    pub fn log(start: f64, stop: f64, count: usize) -> Self {
        Self {
            start,
            stop,
            count,
            scale: RangeScale::Log,
        }
    }

    pub fn values(&self, key: &str) -> Result<Vec<ParamValue>> {
        if !self.start.is_finite() || !self.stop.is_finite() {
            return Err(SweepError::config(key, "range bounds must be finite"));
        }
        if self.count == 0 {
            return Err(SweepError::config(key, "range count must be at least 1"));
        }
        if self.scale == RangeScale::Log && (self.start <= 0.0 || self.stop <= 0.0) {
            return Err(SweepError::config(
                key,
                format!(
                    "logarithmic range requires positive bounds (start={}, stop={})",
                    self.start, self.stop
                ),
            ));
        }
        if self.count == 1 {
            return Ok(vec![ParamValue::Float(self.start)]);
        }
        let last = self.count - 1;
        let values = (0..self.count)
            .map(|i| {
                let v = if i == last {
                    self.stop
                } else {
                    let t = i as f64 / last as f64;
                    match self.scale {
                        RangeScale::Linear => self.start + (self.stop - self.start) * t,
                        RangeScale::Log => {
                            let (a, b) = (self.start.ln(), self.stop.ln());
                            (a + (b - a) * t).exp()
                        }
                    }
                };
                ParamValue::Float(v)
            })
            .collect();
        Ok(values)
    }
}

/// What a sweep file may say about one overridden parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValueSpec {
    List(Vec<ParamValue>),
    Range(RangeSpec),
}

impl ValueSpec {
    /// Collapse to the explicit, normalized value sequence.
    pub fn values(&self, key: &str) -> Result<Vec<ParamValue>> {
        let raw = match self {
            ValueSpec::List(values) => {
                if values.is_empty() {
                    return Err(SweepError::config(key, "must have at least one value"));
                }
                values.clone()
            }
            ValueSpec::Range(range) => range.values(key)?,
        };
        raw.into_iter().map(|v| v.normalize(key)).collect()
    }
}

impl From<Vec<ParamValue>> for ValueSpec {
    fn from(values: Vec<ParamValue>) -> Self {
        ValueSpec::List(values)
    }
}

impl From<RangeSpec> for ValueSpec {
    fn from(range: RangeSpec) -> Self {
        ValueSpec::Range(range)
    }
}
