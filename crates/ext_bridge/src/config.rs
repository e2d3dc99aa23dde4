//! Bridge configuration

use std::path::Path;
use std::time::Duration;

use ext_transport::{CheckoutPolicy, ScratchConfig};
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Settings for an extension bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Fail class registration on methods with unrepresentable types
    /// instead of skipping them
    pub strict_registration: bool,
    /// Number of scratch buffers for direct calls across the boundary
    pub scratch_buffers: usize,
    /// Size of each scratch buffer in bytes
    pub scratch_buffer_size: usize,
    /// Behavior when every scratch buffer is checked out
    pub checkout_policy: CheckoutPolicy,
    /// Bound on a blocking checkout, zero waits forever
    pub checkout_timeout_ms: u64,
    /// Capacity of channel-backed signals, zero is unbounded
    pub relay_channel_capacity: usize,
    /// Force the editor flag instead of asking the engine
    pub editor_hint_override: Option<bool>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            strict_registration: false,
            scratch_buffers: 4,
            scratch_buffer_size: 4096,
            checkout_policy: CheckoutPolicy::Block,
            checkout_timeout_ms: 5000,
            relay_channel_capacity: 0,
            editor_hint_override: None,
        }
    }
}

impl BridgeConfig {
    /// Parse from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| BridgeError::Settings {
            path: "<inline>".into(),
            message: e.to_string(),
        })
    }

    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| BridgeError::Settings {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    pub fn with_strict_registration(mut self, strict: bool) -> Self {
        self.strict_registration = strict;
        self
    }

    pub fn with_scratch_buffers(mut self, count: usize, size: usize) -> Self {
        self.scratch_buffers = count;
        self.scratch_buffer_size = size;
        self
    }

    pub fn with_checkout_policy(mut self, policy: CheckoutPolicy) -> Self {
        self.checkout_policy = policy;
        self
    }

    pub fn with_editor_hint(mut self, editor: bool) -> Self {
        self.editor_hint_override = Some(editor);
        self
    }

    /// Scratch pool settings
    pub fn scratch(&self) -> ScratchConfig {
        ScratchConfig {
            buffers: self.scratch_buffers,
            buffer_size: self.scratch_buffer_size,
            policy: self.checkout_policy,
            timeout: (self.checkout_timeout_ms > 0)
                .then(|| Duration::from_millis(self.checkout_timeout_ms)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert!(!config.strict_registration);
        assert_eq!(config.scratch().timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_from_toml() {
        let config = BridgeConfig::from_toml_str(
            r#"
            strict_registration = true
            checkout_policy = "fail_fast"
            checkout_timeout_ms = 0
            "#,
        )
        .unwrap();
        assert!(config.strict_registration);
        assert_eq!(config.checkout_policy, CheckoutPolicy::FailFast);
        assert_eq!(config.scratch().timeout, None);
        assert_eq!(config.scratch_buffers, 4);
    }

    #[test]
    fn test_bad_toml() {
        assert!(matches!(
            BridgeConfig::from_toml_str("scratch_buffers = \"many\""),
            Err(BridgeError::Settings { .. })
        ));
    }
}
