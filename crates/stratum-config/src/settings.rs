//! Mesh-wide settings stored in topology files.

use serde::{Deserialize, Serialize};
use stratum_core::MeshSettings;

/// The `[settings]` table of a topology file.
///
/// ```toml
/// [settings]
/// auto_taste = true
/// trace = "stratum::topology=debug"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    /// Offer every new provider to all classes.
    #[serde(default)]
    pub auto_taste: bool,

    /// Log filter directive applied when no `RUST_LOG` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl Settings {
    /// Settings handed to [`Mesh::with_settings`](stratum_core::Mesh::with_settings).
    pub fn mesh_settings(&self) -> MeshSettings {
        MeshSettings {
            auto_taste: self.auto_taste,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_default() {
        let settings: Settings = toml::from_str("").unwrap();
        assert_eq!(settings, Settings::default());
        assert!(!settings.mesh_settings().auto_taste);
    }

    #[test]
    fn auto_taste_carries_over() {
        let settings: Settings = toml::from_str("auto_taste = true\ntrace = \"debug\"").unwrap();
        assert!(settings.mesh_settings().auto_taste);
        assert_eq!(settings.trace.as_deref(), Some("debug"));
    }
}
