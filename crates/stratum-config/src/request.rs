//! Control requests as stored in topology files.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use stratum_core::{ControlRequest, ParamValue};

/// One parameter value in a topology file.
///
/// TOML integers, booleans, strings and string arrays map onto the matching
/// control-request parameter types.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ParamConfig {
    /// `true` / `false`, sent as `1` / `0`.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Text.
    Text(String),
    /// List of names.
    List(Vec<String>),
}

impl ParamConfig {
    /// Integer view: integers, booleans and numeric text (decimal or `0x` hex).
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ParamConfig::Int(v) => Some(*v),
            ParamConfig::Bool(b) => Some(i64::from(*b)),
            ParamConfig::Text(s) => parse_int(s),
            ParamConfig::List(_) => None,
        }
    }

    /// Text view.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ParamConfig::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<ParamConfig> for ParamValue {
    fn from(value: ParamConfig) -> Self {
        match value {
            ParamConfig::Bool(b) => ParamValue::from(b),
            ParamConfig::Int(v) => ParamValue::Int(v),
            ParamConfig::Text(s) => ParamValue::Text(s),
            ParamConfig::List(items) => {
                ParamValue::List(items.into_iter().map(String::into_bytes).collect())
            }
        }
    }
}

impl From<i64> for ParamConfig {
    fn from(v: i64) -> Self {
        ParamConfig::Int(v)
    }
}

impl From<bool> for ParamConfig {
    fn from(v: bool) -> Self {
        ParamConfig::Bool(v)
    }
}

impl From<&str> for ParamConfig {
    fn from(v: &str) -> Self {
        ParamConfig::Text(v.to_string())
    }
}

impl From<Vec<&str>> for ParamConfig {
    fn from(v: Vec<&str>) -> Self {
        ParamConfig::List(v.into_iter().map(str::to_string).collect())
    }
}

/// Parses a parameter string: decimal, or hex with a `0x` prefix.
///
/// # Example
///
/// ```rust
/// use stratum_config::parse_int;
///
/// assert_eq!(parse_int("4096"), Some(4096));
/// assert_eq!(parse_int("0x200"), Some(512));
/// assert_eq!(parse_int("lots"), None);
/// ```
pub fn parse_int(text: &str) -> Option<i64> {
    let text = text.trim();
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => i64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

/// One control request: a class, a verb and named parameters.
///
/// # TOML Format
///
/// ```toml
/// [[requests]]
/// class = "MD"
/// verb = "create"
/// [requests.params]
/// name = "disk0"
/// size = 1048576
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestConfig {
    /// Target class name.
    pub class: String,
    /// Verb.
    pub verb: String,
    /// Parameters by name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, ParamConfig>,
}

impl RequestConfig {
    /// A request without parameters.
    pub fn new(class: impl Into<String>, verb: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            verb: verb.into(),
            params: BTreeMap::new(),
        }
    }

    /// Adds a parameter.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<ParamConfig>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Parameter lookup.
    pub fn param(&self, name: &str) -> Option<&ParamConfig> {
        self.params.get(name)
    }

    /// Builds the control request sent to the mesh.
    pub fn to_request(&self) -> ControlRequest {
        self.params.iter().fold(
            ControlRequest::new(&self.class, &self.verb),
            |req, (name, value)| req.with(name, value.clone()),
        )
    }

    /// Short form for logs and error messages: `CLASS verb`.
    pub fn display(&self) -> String {
        format!("{} {}", self.class, self.verb)
    }
}
