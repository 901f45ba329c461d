//! Topology files and settings for stratum meshes.
//!
//! A topology file is a TOML list of control requests plus mesh settings.
//! Replaying it against a mesh with the built-in classes registered
//! rebuilds the stack it describes.
//!
//! # Features
//!
//! - **Topology files**: load, save and replay ([`TopologyFile`])
//! - **Validation**: classes, verbs and parameters checked before replay
//! - **Paths**: platform-specific topology directories
//!
//! # Example
//!
//! ```rust
//! use stratum_config::{RequestConfig, TopologyFile};
//!
//! let topology = TopologyFile::new("scratch")
//!     .with_request(RequestConfig::new("MD", "create").with_param("name", "a").with_param("size", 1_i64 << 20))
//!     .with_request(RequestConfig::new("NOP", "create").with_param("provider", "a"));
//!
//! let mesh = topology.build().unwrap();
//! assert!(mesh.topology().provider_by_name("a.nop").is_some());
//! ```

mod error;
mod request;
mod settings;
mod topology;

/// Platform-specific paths for topology files.
pub mod paths;

/// Topology validation.
pub mod validation;

pub use error::ConfigError;
pub use paths::{
    ensure_user_topologies_dir, find_topology, list_all_topologies, list_user_topologies,
    system_topologies_dir, topology_name_from_path, user_config_dir, user_topologies_dir,
};
pub use request::{ParamConfig, RequestConfig, parse_int};
pub use settings::Settings;
pub use topology::TopologyFile;
pub use validation::{
    STANDARD_VERBS, TopologyValidator, ValidationError, ValidationResult, validate_class,
    validate_topology,
};

/// Re-export of the class catalog the validator checks against.
pub use stratum_classes::{ClassCatalog, ClassDescriptor, ClassKind};
