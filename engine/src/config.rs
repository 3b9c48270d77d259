//! Store configuration.

use serde::{Deserialize, Serialize};
use std::env;

/// How a diff is applied when its recorded prior values disagree with the
/// live record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictPolicy {
    /// Refuse the diff with [`crate::Error::Conflict`].
    #[default]
    Strict,
    /// Overwrite whatever is there.
    LastWriterWins,
}

impl std::str::FromStr for ConflictPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "lastwriterwins" | "last-writer-wins" | "last_writer_wins" | "lww" => {
                Ok(Self::LastWriterWins)
            }
            other => Err(ConfigError::InvalidConflictPolicy(other.to_string())),
        }
    }
}

/// Tunables for a [`crate::Store`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreConfig {
    /// Policy used when loading server data and replaying local diffs.
    pub conflict_policy: ConflictPolicy,
}

impl StoreConfig {
    /// Load configuration from environment variables.
    ///
    /// `JAM_CONFLICT_POLICY` selects the conflict policy; it defaults to
    /// `strict` when unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let conflict_policy = match env::var("JAM_CONFLICT_POLICY") {
            Ok(value) => value.parse()?,
            Err(_) => ConflictPolicy::default(),
        };

        Ok(Self { conflict_policy })
    }

    /// Builder-style setter for the conflict policy.
    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid JAM_CONFLICT_POLICY value: {0}")]
    InvalidConflictPolicy(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_strict() {
        assert_eq!(StoreConfig::default().conflict_policy, ConflictPolicy::Strict);
    }

    #[test]
    fn parse_policy_names() {
        assert_eq!(
            "strict".parse::<ConflictPolicy>().unwrap(),
            ConflictPolicy::Strict
        );
        assert_eq!(
            "Last-Writer-Wins".parse::<ConflictPolicy>().unwrap(),
            ConflictPolicy::LastWriterWins
        );
        assert!("sometimes".parse::<ConflictPolicy>().is_err());
    }

    #[test]
    fn deserialize_partial_config() {
        let config: StoreConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, StoreConfig::default());

        let config: StoreConfig =
            serde_json::from_str(r#"{"conflictPolicy": "lastWriterWins"}"#).unwrap();
        assert_eq!(config.conflict_policy, ConflictPolicy::LastWriterWins);
    }
}
