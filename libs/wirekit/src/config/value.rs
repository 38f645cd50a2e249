//! Typed configuration values and the coercion rules applied to raw input.
//!
//! `parse_config` is deliberately total over strings: a value that cannot be
//! parsed into the declared type degrades (`NaN`, `false`, a single-element
//! array, a JSON string) instead of erroring, so a bad environment variable
//! never takes the process down.

use serde_json::Value as JsonValue;

/// Declared type of a configuration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKind {
    String,
    Number,
    Boolean,
    StringArray,
    Record,
    Internal,
}

impl ConfigKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::StringArray => "string[]",
            Self::Record => "record",
            Self::Internal => "internal",
        }
    }
}

/// A resolved configuration value.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    String(String),
    Number(f64),
    Boolean(bool),
    StringArray(Vec<String>),
    Record(JsonValue),
    Internal(JsonValue),
}

impl ConfigValue {
    #[must_use]
    pub fn kind(&self) -> ConfigKind {
        match self {
            Self::String(_) => ConfigKind::String,
            Self::Number(_) => ConfigKind::Number,
            Self::Boolean(_) => ConfigKind::Boolean,
            Self::StringArray(_) => ConfigKind::StringArray,
            Self::Record(_) => ConfigKind::Record,
            Self::Internal(_) => ConfigKind::Internal,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_string_array(&self) -> Option<&[String]> {
        match self {
            Self::StringArray(items) => Some(items),
            _ => None,
        }
    }

    /// JSON payload of a `record` or `internal` value.
    #[must_use]
    pub fn as_json(&self) -> Option<&JsonValue> {
        match self {
            Self::Record(v) | Self::Internal(v) => Some(v),
            _ => None,
        }
    }

    pub(crate) fn to_json(&self) -> JsonValue {
        match self {
            Self::String(s) => JsonValue::String(s.clone()),
            Self::Number(n) => serde_json::Number::from_f64(*n)
                .map_or(JsonValue::Null, JsonValue::Number),
            Self::Boolean(b) => JsonValue::Bool(*b),
            Self::StringArray(items) => {
                JsonValue::Array(items.iter().cloned().map(JsonValue::String).collect())
            }
            Self::Record(v) | Self::Internal(v) => v.clone(),
        }
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<f64> for ConfigValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<bool> for ConfigValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<Vec<String>> for ConfigValue {
    fn from(value: Vec<String>) -> Self {
        Self::StringArray(value)
    }
}

/// Parse a raw string into a value of the declared kind. Total: never errors.
#[must_use]
pub fn parse_config(kind: ConfigKind, raw: &str) -> ConfigValue {
    match kind {
        ConfigKind::String => ConfigValue::String(raw.to_owned()),
        ConfigKind::Number => {
            ConfigValue::Number(raw.trim().parse::<f64>().unwrap_or(f64::NAN))
        }
        ConfigKind::Boolean => ConfigValue::Boolean(matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "true" | "y" | "1" | "on"
        )),
        ConfigKind::StringArray => match serde_json::from_str::<Vec<String>>(raw) {
            Ok(items) => ConfigValue::StringArray(items),
            Err(_) => ConfigValue::StringArray(vec![raw.to_owned()]),
        },
        ConfigKind::Record | ConfigKind::Internal => {
            let json = serde_json::from_str::<JsonValue>(raw)
                .unwrap_or_else(|_| JsonValue::String(raw.to_owned()));
            if kind == ConfigKind::Record {
                ConfigValue::Record(json)
            } else {
                ConfigValue::Internal(json)
            }
        }
    }
}

/// Coerce an arbitrary value to the declared kind.
///
/// Idempotent on values that already carry the declared kind; strings go
/// through [`parse_config`]; everything else is routed through its JSON
/// rendering.
#[must_use]
pub fn coerce(kind: ConfigKind, value: ConfigValue) -> ConfigValue {
    if value.kind() == kind {
        return value;
    }
    match value {
        ConfigValue::String(raw) => parse_config(kind, &raw),
        other => from_raw(kind, &other.to_json()),
    }
}

/// Coerce a raw JSON value (as produced by the file loaders or a bootstrap
/// partial) into the declared kind.
pub(crate) fn from_raw(kind: ConfigKind, raw: &JsonValue) -> ConfigValue {
    if let JsonValue::String(s) = raw {
        return parse_config(kind, s);
    }
    match kind {
        ConfigKind::String => ConfigValue::String(render_scalar(raw)),
        ConfigKind::Number => ConfigValue::Number(raw.as_f64().unwrap_or(f64::NAN)),
        ConfigKind::Boolean => ConfigValue::Boolean(raw.as_bool().unwrap_or(false)),
        ConfigKind::StringArray => match raw {
            JsonValue::Array(items) => {
                ConfigValue::StringArray(items.iter().map(render_scalar).collect())
            }
            other => ConfigValue::StringArray(vec![render_scalar(other)]),
        },
        ConfigKind::Record => ConfigValue::Record(raw.clone()),
        ConfigKind::Internal => ConfigValue::Internal(raw.clone()),
    }
}

fn render_scalar(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Schema entry for a single configuration key.
#[derive(Debug, Clone)]
pub struct ConfigSpec {
    pub kind: ConfigKind,
    pub default: Option<ConfigValue>,
    /// Advisory allowed values for string specs. Not enforced; preserved for
    /// introspection.
    pub enum_values: Option<Vec<String>>,
    pub required: bool,
    pub description: String,
}

impl ConfigSpec {
    #[must_use]
    fn of(kind: ConfigKind) -> Self {
        Self {
            kind,
            default: None,
            enum_values: None,
            required: false,
            description: String::new(),
        }
    }

    #[must_use]
    pub fn string() -> Self {
        Self::of(ConfigKind::String)
    }

    #[must_use]
    pub fn number() -> Self {
        Self::of(ConfigKind::Number)
    }

    #[must_use]
    pub fn boolean() -> Self {
        Self::of(ConfigKind::Boolean)
    }

    #[must_use]
    pub fn string_array() -> Self {
        Self::of(ConfigKind::StringArray)
    }

    #[must_use]
    pub fn record() -> Self {
        Self::of(ConfigKind::Record)
    }

    #[must_use]
    pub fn internal() -> Self {
        Self::of(ConfigKind::Internal)
    }

    #[must_use]
    pub fn with_default(mut self, value: impl Into<ConfigValue>) -> Self {
        self.default = Some(coerce(self.kind, value.into()));
        self
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    #[must_use]
    pub fn enumerated<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enum_values = Some(values.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn describe(mut self, text: impl Into<String>) -> Self {
        self.description = text.into();
        self
    }
}
