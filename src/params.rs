//! Declarative experiment parameters.
//!
//! Every experiment type declares a [`ParamSchema`]: an ordered, fixed list of named, typed
//! parameters with their constraints. The schema is built once when the experiment type is
//! defined and resolves caller-supplied overrides into [`ParamValues`] before a run starts.
//!
//! ```rust
//! use labrun::params::{ParamSchema, ParamSpec, ParamValues};
//!
//! let schema = ParamSchema::new()
//!     .with(ParamSpec::float("interval").default_value(0.5).min(0.01))
//!     .with(ParamSpec::select("mode", ["up", "updown"]));
//!
//! let mut overrides = ParamValues::new();
//! overrides.insert("interval", 0.2);
//! let resolved = schema.resolve(&overrides)?;
//! assert_eq!(resolved.f64("interval")?, 0.2);
//! assert_eq!(resolved.str("mode")?, "up");
//! # Ok::<(), labrun::error::LabError>(())
//! ```

use crate::error::{LabError, LabResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

// =============================================================================
// Values
// =============================================================================

/// A resolved parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// Boolean value
    Bool(bool),
    /// Integer value
    Int(i64),
    /// Float value
    Float(f64),
    /// String value
    Text(String),
}

impl ParamValue {
    /// Get as boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Get as integer
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Get as float; integers widen
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Float(v) => Some(*v),
            ParamValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Get as string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            ParamValue::Bool(_) => "bool",
            ParamValue::Int(_) => "int",
            ParamValue::Float(_) => "float",
            ParamValue::Text(_) => "text",
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(v) => write!(f, "{v}"),
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v}"),
            ParamValue::Text(v) => write!(f, "{v}"),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Text(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

/// Name → value mapping handed to an experiment factory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamValues(BTreeMap<String, ParamValue>);

impl ParamValues {
    /// Empty value set
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a value
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<ParamValue>) {
        self.0.insert(name.into(), value.into());
    }

    /// Builder-style insert
    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.insert(name, value);
        self
    }

    /// Raw lookup
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.get(name)
    }

    /// Iterate in name order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.0.iter()
    }

    /// Number of values
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no values are set
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn require(&self, name: &str) -> LabResult<&ParamValue> {
        self.0
            .get(name)
            .ok_or_else(|| LabError::parameter(name, "missing"))
    }

    /// Float lookup
    pub fn f64(&self, name: &str) -> LabResult<f64> {
        let value = self.require(name)?;
        value
            .as_f64()
            .ok_or_else(|| LabError::parameter(name, format!("expected float, got {value}")))
    }

    /// Integer lookup
    pub fn i64(&self, name: &str) -> LabResult<i64> {
        let value = self.require(name)?;
        value
            .as_i64()
            .ok_or_else(|| LabError::parameter(name, format!("expected int, got {value}")))
    }

    /// Boolean lookup
    pub fn bool(&self, name: &str) -> LabResult<bool> {
        let value = self.require(name)?;
        value
            .as_bool()
            .ok_or_else(|| LabError::parameter(name, format!("expected bool, got {value}")))
    }

    /// Text lookup
    pub fn str(&self, name: &str) -> LabResult<&str> {
        let value = self.require(name)?;
        value
            .as_str()
            .ok_or_else(|| LabError::parameter(name, format!("expected text, got {value}")))
    }
}

impl<K: Into<String>, V: Into<ParamValue>> FromIterator<(K, V)> for ParamValues {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

// =============================================================================
// Schema
// =============================================================================

/// Kind and constraints of a parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParamKind {
    /// Floating point number
    Float {
        /// Inclusive lower bound
        min: Option<f64>,
        /// Inclusive upper bound
        max: Option<f64>,
    },
    /// Integer
    Int {
        /// Inclusive lower bound
        min: Option<i64>,
        /// Inclusive upper bound
        max: Option<i64>,
    },
    /// Free text
    Text {
        /// Whether an empty (or whitespace-only) string is accepted
        allow_blank: bool,
    },
    /// Boolean flag
    Bool,
    /// One value out of a fixed list
    Select {
        /// Allowed values
        choices: Vec<ParamValue>,
        /// Index into `choices` used when no value is given
        default_index: usize,
    },
}

/// Definition of a single parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    /// Parameter name
    pub name: String,
    /// Kind and constraints
    pub kind: ParamKind,
    /// Value used when the caller gives none; `None` makes the parameter required
    pub default: Option<ParamValue>,
    /// Physical units (optional)
    pub units: Option<String>,
    /// Short description for listings
    pub description: String,
}

impl ParamSpec {
    fn with_kind(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
            units: None,
            description: String::new(),
        }
    }

    /// A float parameter without bounds
    pub fn float(name: impl Into<String>) -> Self {
        Self::with_kind(name, ParamKind::Float { min: None, max: None })
    }

    /// An integer parameter without bounds
    pub fn int(name: impl Into<String>) -> Self {
        Self::with_kind(name, ParamKind::Int { min: None, max: None })
    }

    /// A text parameter that rejects blank input
    pub fn text(name: impl Into<String>) -> Self {
        Self::with_kind(name, ParamKind::Text { allow_blank: false })
    }

    /// A boolean parameter defaulting to `false`
    pub fn bool(name: impl Into<String>) -> Self {
        Self::with_kind(name, ParamKind::Bool).default_value(false)
    }

    /// A single-choice parameter defaulting to the first choice
    pub fn select<I, V>(name: impl Into<String>, choices: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<ParamValue>,
    {
        Self::with_kind(
            name,
            ParamKind::Select {
                choices: choices.into_iter().map(Into::into).collect(),
                default_index: 0,
            },
        )
    }

    /// Set the default value
    pub fn default_value(mut self, value: impl Into<ParamValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Set the lower bound of a numeric parameter
    pub fn min(mut self, bound: f64) -> Self {
        match &mut self.kind {
            ParamKind::Float { min, .. } => *min = Some(bound),
            ParamKind::Int { min, .. } => *min = Some(bound as i64),
            _ => warn!(param = %self.name, "min() ignored on non-numeric parameter"),
        }
        self
    }

    /// Set the upper bound of a numeric parameter
    pub fn max(mut self, bound: f64) -> Self {
        match &mut self.kind {
            ParamKind::Float { max, .. } => *max = Some(bound),
            ParamKind::Int { max, .. } => *max = Some(bound as i64),
            _ => warn!(param = %self.name, "max() ignored on non-numeric parameter"),
        }
        self
    }

    /// Accept blank text
    pub fn allow_blank(mut self) -> Self {
        if let ParamKind::Text { allow_blank } = &mut self.kind {
            *allow_blank = true;
        }
        self
    }

    /// Choose which select entry is the default
    pub fn default_index(mut self, index: usize) -> Self {
        if let ParamKind::Select { default_index, .. } = &mut self.kind {
            *default_index = index;
        }
        self
    }

    /// Set the units
    pub fn units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }

    /// Set the description
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// The value used when the caller supplies none
    pub fn effective_default(&self) -> Option<ParamValue> {
        if let Some(default) = &self.default {
            return Some(default.clone());
        }
        match &self.kind {
            ParamKind::Select {
                choices,
                default_index,
            } => choices.get(*default_index).cloned(),
            _ => None,
        }
    }

    /// Parse a textual value (e.g. from the command line) according to the kind
    pub fn parse(&self, raw: &str) -> LabResult<ParamValue> {
        let bad = |what: &str| LabError::parameter(&self.name, format!("'{raw}' is not {what}"));
        match &self.kind {
            ParamKind::Float { .. } => raw
                .trim()
                .parse::<f64>()
                .map(ParamValue::Float)
                .map_err(|_| bad("a number")),
            ParamKind::Int { .. } => raw
                .trim()
                .parse::<i64>()
                .map(ParamValue::Int)
                .map_err(|_| bad("an integer")),
            ParamKind::Bool => match raw.trim().to_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Ok(ParamValue::Bool(true)),
                "false" | "no" | "off" | "0" => Ok(ParamValue::Bool(false)),
                _ => Err(bad("a boolean")),
            },
            ParamKind::Text { .. } => Ok(ParamValue::Text(raw.to_string())),
            ParamKind::Select { choices, .. } => choices
                .iter()
                .find(|choice| choice.to_string() == raw.trim())
                .cloned()
                .ok_or_else(|| bad("one of the allowed choices")),
        }
    }

    /// Coerce and check a value against this spec
    pub fn validate(&self, value: &ParamValue) -> LabResult<ParamValue> {
        let mismatch = || {
            LabError::parameter(
                &self.name,
                format!("expected {}, got {} ({value})", self.kind_name(), value.type_name()),
            )
        };

        match &self.kind {
            ParamKind::Float { min, max } => {
                let v = value.as_f64().ok_or_else(mismatch)?;
                if !v.is_finite() {
                    return Err(LabError::parameter(&self.name, "must be finite"));
                }
                if let Some(min) = min {
                    if v < *min {
                        return Err(LabError::parameter(&self.name, format!("{v} < min {min}")));
                    }
                }
                if let Some(max) = max {
                    if v > *max {
                        return Err(LabError::parameter(&self.name, format!("{v} > max {max}")));
                    }
                }
                Ok(ParamValue::Float(v))
            }
            ParamKind::Int { min, max } => {
                let v = value.as_i64().ok_or_else(mismatch)?;
                if let Some(min) = min {
                    if v < *min {
                        return Err(LabError::parameter(&self.name, format!("{v} < min {min}")));
                    }
                }
                if let Some(max) = max {
                    if v > *max {
                        return Err(LabError::parameter(&self.name, format!("{v} > max {max}")));
                    }
                }
                Ok(ParamValue::Int(v))
            }
            ParamKind::Text { allow_blank } => {
                let v = value.as_str().ok_or_else(mismatch)?;
                if !allow_blank && v.trim().is_empty() {
                    return Err(LabError::parameter(&self.name, "must not be blank"));
                }
                Ok(value.clone())
            }
            ParamKind::Bool => value.as_bool().map(ParamValue::Bool).ok_or_else(mismatch),
            ParamKind::Select { choices, .. } => {
                if choices.iter().any(|choice| choice == value) {
                    Ok(value.clone())
                } else {
                    let allowed: Vec<String> = choices.iter().map(ToString::to_string).collect();
                    Err(LabError::parameter(
                        &self.name,
                        format!("{value} is not one of [{}]", allowed.join(", ")),
                    ))
                }
            }
        }
    }

    /// Short human-readable kind, e.g. for CLI listings
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            ParamKind::Float { .. } => "float",
            ParamKind::Int { .. } => "int",
            ParamKind::Text { .. } => "text",
            ParamKind::Bool => "bool",
            ParamKind::Select { .. } => "select",
        }
    }
}

/// Ordered list of parameter definitions for one experiment type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamSchema(Vec<ParamSpec>);

impl ParamSchema {
    /// An empty schema
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a parameter definition
    pub fn with(mut self, spec: ParamSpec) -> Self {
        self.0.push(spec);
        self
    }

    /// Look up a definition by name
    pub fn get(&self, name: &str) -> Option<&ParamSpec> {
        self.0.iter().find(|spec| spec.name == name)
    }

    /// Definitions in declaration order
    pub fn iter(&self) -> impl Iterator<Item = &ParamSpec> {
        self.0.iter()
    }

    /// Number of declared parameters
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the schema declares no parameters
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Resolve overrides against the schema.
    ///
    /// Declared parameters take the override if present, otherwise the default. A parameter
    /// with neither is a configuration error. Overrides naming undeclared parameters are
    /// ignored with a warning.
    pub fn resolve(&self, overrides: &ParamValues) -> LabResult<ParamValues> {
        for (name, _) in overrides.iter() {
            if self.get(name).is_none() {
                warn!(param = %name, "Ignoring value for undeclared parameter");
            }
        }

        let mut resolved = ParamValues::new();
        for spec in &self.0 {
            let raw = match overrides.get(&spec.name) {
                Some(value) => value.clone(),
                None => spec
                    .effective_default()
                    .ok_or_else(|| LabError::parameter(&spec.name, "missing"))?,
            };
            resolved.insert(spec.name.clone(), spec.validate(&raw)?);
        }
        Ok(resolved)
    }

    /// Parse `name=value` strings (CLI form) into typed overrides.
    pub fn parse_assignments<'a, I>(&self, assignments: I) -> LabResult<ParamValues>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut values = ParamValues::new();
        for assignment in assignments {
            let (name, raw) = assignment.split_once('=').ok_or_else(|| {
                LabError::parameter(assignment, "expected the form name=value")
            })?;
            let name = name.trim();
            let spec = self
                .get(name)
                .ok_or_else(|| LabError::parameter(name, "not declared by this experiment"))?;
            values.insert(name, spec.parse(raw)?);
        }
        Ok(values)
    }
}
