//! Topology file format and replay.

use serde::{Deserialize, Serialize};
use std::path::Path;

use stratum_classes::ClassCatalog;
use stratum_core::{ControlRequest, Mesh, MeshHandle};

use crate::error::ConfigError;
use crate::request::RequestConfig;
use crate::settings::Settings;
use crate::validation::TopologyValidator;

/// A stored mesh: settings plus the control requests that build it.
///
/// Requests replay in file order, so later requests can name providers
/// created by earlier ones.
///
/// # TOML Format
///
/// ```toml
/// name = "mirrored"
/// description = "Two memory disks under a mirror"
///
/// [settings]
/// auto_taste = false
///
/// [[requests]]
/// class = "MD"
/// verb = "create"
/// [requests.params]
/// name = "a"
/// size = 1048576
///
/// [[requests]]
/// class = "MD"
/// verb = "create"
/// [requests.params]
/// name = "b"
/// size = 1048576
///
/// [[requests]]
/// class = "MIRROR"
/// verb = "create"
/// [requests.params]
/// name = "m0"
/// components = ["a", "b"]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopologyFile {
    /// Name of the topology.
    pub name: String,

    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Mesh settings.
    #[serde(default)]
    pub settings: Settings,

    /// Requests to replay, in order.
    #[serde(default)]
    pub requests: Vec<RequestConfig>,
}

impl TopologyFile {
    /// An empty topology.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            settings: Settings::default(),
            requests: Vec::new(),
        }
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets the mesh settings.
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Appends a request.
    pub fn with_request(mut self, request: RequestConfig) -> Self {
        self.requests.push(request);
        self
    }

    /// Load a topology from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::read_file(path, e))?;
        let topology: TopologyFile = toml::from_str(&content)?;
        Ok(topology)
    }

    /// Load a topology from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Save the topology to a TOML file, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::create_dir(parent, e))?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| ConfigError::write_file(path, e))?;
        Ok(())
    }

    /// Convert the topology to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Number of requests.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// True if there are no requests.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Replays every request against `mesh`, then waits for the deferred
    /// work they queued.
    ///
    /// Stops at the first failing request. Returns the completed requests,
    /// which carry any parameters the classes wrote back.
    pub fn apply(&self, mesh: &MeshHandle) -> Result<Vec<ControlRequest>, ConfigError> {
        let mut done = Vec::with_capacity(self.requests.len());
        for (index, request) in self.requests.iter().enumerate() {
            let req = mesh.control(request.to_request());
            if let Some(message) = req.error_message() {
                tracing::warn!(
                    target: "stratum::ctl",
                    topology = %self.name,
                    index,
                    request = %request.display(),
                    message,
                    "topology replay stopped"
                );
                return Err(ConfigError::Request {
                    index,
                    class: request.class.clone(),
                    verb: request.verb.clone(),
                    message: message.to_string(),
                });
            }
            tracing::debug!(target: "stratum::ctl", index, request = %request.display(), "replayed");
            done.push(req);
        }
        mesh.settle()?;
        Ok(done)
    }

    /// Validates the file, then builds a fresh mesh with every built-in
    /// class registered and the requests replayed.
    pub fn build(&self) -> Result<Mesh, ConfigError> {
        TopologyValidator::new().validate_topology(self)?;
        let mesh = Mesh::with_settings(self.settings.mesh_settings());
        ClassCatalog::new().register_all(&mesh.handle())?;
        self.apply(&mesh.handle())?;
        tracing::info!(
            target: "stratum::ctl",
            topology = %self.name,
            requests = self.len(),
            "topology built"
        );
        Ok(mesh)
    }
}

impl Default for TopologyFile {
    fn default() -> Self {
        Self::new("Untitled")
    }
}
