//! Space configuration: participants and their static capabilities.

use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::envelope::GATEWAY_ID;
use crate::pattern::CapabilityPattern;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Reserved participant id: {0}")]
    ReservedId(String),
    #[error("Duplicate participant id: {0}")]
    DuplicateId(String),
}

/// One configured participant: stable logical id, join token, and the
/// static capability set that grants/revokes never touch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantConfig {
    pub id: String,
    pub token: String,
    #[serde(default)]
    pub capabilities: Vec<CapabilityPattern>,
}

/// Configuration for one space.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpaceConfig {
    pub space_id: String,
    #[serde(default)]
    pub participants: Vec<ParticipantConfig>,
}

impl SpaceConfig {
    pub fn new(space_id: impl Into<String>) -> Self {
        Self {
            space_id: space_id.into(),
            participants: Vec::new(),
        }
    }

    /// Load from a JSON file and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save to a JSON file.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Reject reserved and duplicate ids. Superuser grants are legal but
    /// logged distinctly given their power.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for participant in &self.participants {
            if participant.id == GATEWAY_ID {
                return Err(ConfigError::ReservedId(participant.id.clone()));
            }
            if !seen.insert(participant.id.as_str()) {
                return Err(ConfigError::DuplicateId(participant.id.clone()));
            }
            for pattern in &participant.capabilities {
                if pattern.is_superuser() {
                    tracing::warn!(
                        participant = %participant.id,
                        "configured with superuser capability (kind \"**\", no payload clause)"
                    );
                }
            }
        }
        Ok(())
    }

    /// Look up a participant by logical id.
    pub fn participant(&self, id: &str) -> Option<&ParticipantConfig> {
        self.participants.iter().find(|p| p.id == id)
    }

    /// Resolve a join attempt: the id must be configured and the token must
    /// match. Token comparison is plain equality; anything stronger is an
    /// authentication concern outside the gateway core.
    pub fn authenticate(&self, id: &str, token: &str) -> Option<&ParticipantConfig> {
        self.participant(id).filter(|p| p.token == token)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn make_config() -> SpaceConfig {
        SpaceConfig {
            space_id: "demo".to_string(),
            participants: vec![
                ParticipantConfig {
                    id: "human".to_string(),
                    token: "tok-human".to_string(),
                    capabilities: vec![CapabilityPattern::for_kind("**")],
                },
                ParticipantConfig {
                    id: "assistant".to_string(),
                    token: "tok-assistant".to_string(),
                    capabilities: vec![
                        CapabilityPattern::for_kind("chat"),
                        CapabilityPattern::with_payload(
                            "mcp.request",
                            json!({"method": "tools/*"}),
                        ),
                    ],
                },
            ],
        }
    }

    #[test]
    fn test_participant_lookup() {
        let config = make_config();
        assert!(config.participant("assistant").is_some());
        assert!(config.participant("nobody").is_none());
    }

    #[test]
    fn test_authenticate() {
        let config = make_config();
        assert!(config.authenticate("assistant", "tok-assistant").is_some());
        assert!(config.authenticate("assistant", "wrong").is_none());
        assert!(config.authenticate("nobody", "tok-assistant").is_none());
    }

    #[test]
    fn test_validate_rejects_reserved_id() {
        let mut config = make_config();
        config.participants.push(ParticipantConfig {
            id: GATEWAY_ID.to_string(),
            token: "x".to_string(),
            capabilities: Vec::new(),
        });
        assert!(matches!(config.validate(), Err(ConfigError::ReservedId(_))));
    }

    #[test]
    fn test_validate_rejects_duplicate_id() {
        let mut config = make_config();
        config.participants.push(ParticipantConfig {
            id: "human".to_string(),
            token: "x".to_string(),
            capabilities: Vec::new(),
        });
        assert!(matches!(config.validate(), Err(ConfigError::DuplicateId(_))));
    }

    #[test]
    fn test_file_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("space.json");
        let config = make_config();
        config.save(&path).unwrap();
        let loaded = SpaceConfig::load(&path).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_validates() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("space.json");
        fs::write(
            &path,
            r#"{"space_id":"x","participants":[
                {"id":"a","token":"t","capabilities":[]},
                {"id":"a","token":"t2","capabilities":[]}
            ]}"#,
        )
        .unwrap();
        assert!(SpaceConfig::load(&path).is_err());
    }

    #[test]
    fn test_capabilities_default_empty() {
        let json = r#"{"space_id":"x","participants":[{"id":"a","token":"t"}]}"#;
        let config: SpaceConfig = serde_json::from_str(json).unwrap();
        assert!(config.participants[0].capabilities.is_empty());
    }
}
