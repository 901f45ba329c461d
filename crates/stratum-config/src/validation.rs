//! Topology validation.
//!
//! Checks requests against the class catalog before anything touches a
//! mesh: the class must exist, the verb must be one it understands, the
//! parameters it needs must be present, and numeric parameters must parse.
//! Validation cannot see providers created at replay time, so names are
//! checked only for presence.
//!
//! # Example
//!
//! ```rust
//! use stratum_config::{RequestConfig, TopologyValidator};
//!
//! let validator = TopologyValidator::new();
//! let request = RequestConfig::new("MD", "create").with_param("size", 1_i64 << 20);
//! validator.validate_request(&request).expect("MD create is valid");
//! ```

use stratum_classes::{ClassCatalog, ClassDescriptor};
use thiserror::Error;

use crate::request::RequestConfig;
use crate::topology::TopologyFile;

/// Verbs every class understands.
pub const STANDARD_VERBS: [&str; 4] = ["create", "destroy", "configure", "list"];

/// Parameters read as integers.
const INT_PARAMS: [&str; 6] = ["size", "sectorsize", "offset", "length", "error", "readonly"];

/// Validation error types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Unknown class.
    #[error("unknown class: {0}")]
    UnknownClass(String),

    /// The class does not understand the verb.
    #[error("class '{class}' has no verb '{verb}'")]
    UnknownVerb {
        /// Class name.
        class: String,
        /// Offending verb.
        verb: String,
    },

    /// `configure` with an action the class does not implement.
    #[error("class '{class}' has no action '{action}'")]
    UnknownAction {
        /// Class name.
        class: String,
        /// Offending action.
        action: String,
    },

    /// A required parameter is absent.
    #[error("'{class} {verb}' needs parameter '{param}'")]
    MissingParameter {
        /// Class name.
        class: String,
        /// Verb.
        verb: String,
        /// Missing parameter.
        param: String,
    },

    /// Invalid parameter format.
    #[error("invalid format for parameter '{param}': {reason}")]
    InvalidFormat {
        /// Name of the parameter.
        param: String,
        /// Description of the format error.
        reason: String,
    },

    /// Multiple validation errors.
    #[error("multiple validation errors: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Multiple(Vec<ValidationError>),
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Parameters `verb` (or `configure` `action`) needs on `class`.
fn required_params(class: &str, verb: &str, action: Option<&str>) -> &'static [&'static str] {
    match (class, verb, action) {
        (_, "destroy", _) => &["node"],
        ("MD", "configure", Some("resize")) => &["node", "action", "size"],
        ("MIRROR", "configure", Some("insert" | "remove")) => &["node", "action", "component"],
        (_, "configure", _) => &["node", "action"],
        ("MD", "create", _) => &["size"],
        ("NOP", "create", _) => &["provider"],
        ("SLICE", "create", _) => &["provider", "offset"],
        ("MIRROR", "create", _) => &["name", "components"],
        ("LABEL", "label", _) => &["provider", "name"],
        ("LABEL", "clear", _) => &["provider"],
        _ => &[],
    }
}

/// Validator for topology files.
pub struct TopologyValidator {
    catalog: ClassCatalog,
}

impl Default for TopologyValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl TopologyValidator {
    /// A validator over the built-in class catalog.
    pub fn new() -> Self {
        Self {
            catalog: ClassCatalog::new(),
        }
    }

    /// Looks up a class by its exact registered name.
    pub fn validate_class(&self, class: &str) -> ValidationResult<&ClassDescriptor> {
        self.catalog
            .get(class)
            .filter(|d| d.name == class)
            .ok_or_else(|| ValidationError::UnknownClass(class.to_string()))
    }

    /// Validates one request. Reports the first problem found.
    pub fn validate_request(&self, request: &RequestConfig) -> ValidationResult<()> {
        let descriptor = self.validate_class(&request.class)?;
        let verb = request.verb.as_str();
        if !STANDARD_VERBS.contains(&verb) && !descriptor.verbs.contains(&verb) {
            return Err(ValidationError::UnknownVerb {
                class: request.class.clone(),
                verb: request.verb.clone(),
            });
        }

        let action = request.param("action").and_then(|a| a.as_text());
        if verb == "configure"
            && let Some(action) = action
            && !descriptor.actions.contains(&action)
        {
            return Err(ValidationError::UnknownAction {
                class: request.class.clone(),
                action: action.to_string(),
            });
        }

        if let Some(&param) = required_params(descriptor.name, verb, action)
            .iter()
            .find(|p| request.param(p).is_none())
        {
            return Err(ValidationError::MissingParameter {
                class: request.class.clone(),
                verb: request.verb.clone(),
                param: param.to_string(),
            });
        }

        for name in INT_PARAMS {
            if let Some(value) = request.param(name)
                && value.as_int().is_none()
            {
                return Err(ValidationError::InvalidFormat {
                    param: name.to_string(),
                    reason: format!("expected an integer, got {value:?}"),
                });
            }
        }
        Ok(())
    }

    /// Validates every request of a topology. All problems are reported.
    pub fn validate_topology(&self, topology: &TopologyFile) -> ValidationResult<()> {
        let mut errors: Vec<ValidationError> = topology
            .requests
            .iter()
            .filter_map(|r| self.validate_request(r).err())
            .collect();
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ValidationError::Multiple(errors)),
        }
    }
}

/// Validates a class name against the built-in catalog.
pub fn validate_class(class: &str) -> ValidationResult<()> {
    TopologyValidator::new().validate_class(class).map(|_| ())
}

/// Validates a whole topology against the built-in catalog.
pub fn validate_topology(topology: &TopologyFile) -> ValidationResult<()> {
    TopologyValidator::new().validate_topology(topology)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_and_unknown_classes() {
        assert!(validate_class("MIRROR").is_ok());
        assert_eq!(
            validate_class("mirror"),
            Err(ValidationError::UnknownClass("mirror".to_string()))
        );
        assert_eq!(
            validate_class("RAID5"),
            Err(ValidationError::UnknownClass("RAID5".to_string()))
        );
    }

    #[test]
    fn test_class_specific_verbs() {
        let validator = TopologyValidator::new();
        let label = RequestConfig::new("LABEL", "label")
            .with_param("provider", "md0")
            .with_param("name", "data");
        assert!(validator.validate_request(&label).is_ok());

        let wrong = RequestConfig::new("MD", "label");
        assert!(matches!(
            validator.validate_request(&wrong),
            Err(ValidationError::UnknownVerb { ref verb, .. }) if verb == "label"
        ));
    }

    #[test]
    fn test_missing_parameters() {
        let validator = TopologyValidator::new();
        let request = RequestConfig::new("SLICE", "create").with_param("provider", "md0");
        assert_eq!(
            validator.validate_request(&request),
            Err(ValidationError::MissingParameter {
                class: "SLICE".to_string(),
                verb: "create".to_string(),
                param: "offset".to_string(),
            })
        );

        let resize = RequestConfig::new("MD", "configure")
            .with_param("node", "md0")
            .with_param("action", "resize");
        assert!(matches!(
            validator.validate_request(&resize),
            Err(ValidationError::MissingParameter { ref param, .. }) if param == "size"
        ));
    }

    #[test]
    fn test_unknown_action() {
        let request = RequestConfig::new("NOP", "configure")
            .with_param("node", "md0.nop")
            .with_param("action", "explode");
        assert!(matches!(
            TopologyValidator::new().validate_request(&request),
            Err(ValidationError::UnknownAction { ref action, .. }) if action == "explode"
        ));
    }

    #[test]
    fn test_integer_format() {
        let validator = TopologyValidator::new();
        let hex = RequestConfig::new("MD", "create").with_param("size", "0x100000");
        assert!(validator.validate_request(&hex).is_ok());

        let bad = RequestConfig::new("MD", "create").with_param("size", "big");
        assert!(matches!(
            validator.validate_request(&bad),
            Err(ValidationError::InvalidFormat { ref param, .. }) if param == "size"
        ));
    }

    #[test]
    fn test_topology_collects_all_errors() {
        let topology = TopologyFile::new("bad")
            .with_request(RequestConfig::new("MD", "create"))
            .with_request(RequestConfig::new("MD", "create").with_param("size", 4096_i64))
            .with_request(RequestConfig::new("ZFS", "create"));
        let err = validate_topology(&topology).unwrap_err();
        let ValidationError::Multiple(errors) = err else {
            panic!("expected several errors");
        };
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[1].to_string(), "unknown class: ZFS");
    }
}
