//! Execution configuration

use crate::limits::SandboxLimits;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use toolscript_check::DEFAULT_NAMESPACE;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Settings for the code execution pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Guest-visible name of the object holding bridged tools
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default = "default_memory_bytes")]
    pub memory_bytes: usize,

    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,

    #[serde(default = "default_max_timeout_secs")]
    pub max_timeout_secs: u64,

    /// Tools never exposed to guest code, even when they can execute
    #[serde(default = "default_excluded_tools")]
    pub excluded_tools: Vec<String>,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_memory_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_timeout_secs() -> u64 {
    5 * 60
}

fn default_max_timeout_secs() -> u64 {
    60 * 60
}

fn default_excluded_tools() -> Vec<String> {
    [
        // Re-entering the sandbox from inside it
        "code_execution",
        // Human in the loop
        "ask_user_question",
        "propose_plan",
        // UI-only state
        "todo_write",
        "todo_read",
        "status_set",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            memory_bytes: default_memory_bytes(),
            default_timeout_secs: default_timeout_secs(),
            max_timeout_secs: default_max_timeout_secs(),
            excluded_tools: default_excluded_tools(),
        }
    }
}

impl ExecutionConfig {
    /// Load configuration from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        // An empty document is a config with every default.
        let config: ExecutionConfig = if yaml.trim().is_empty() {
            ExecutionConfig::default()
        } else {
            serde_yaml::from_str(yaml)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_identifier(&self.namespace) {
            return Err(ConfigError::Invalid(format!(
                "namespace '{}' is not a valid identifier",
                self.namespace
            )));
        }
        if self.memory_bytes == 0 {
            return Err(ConfigError::Invalid("memory_bytes must be positive".into()));
        }
        if self.max_timeout_secs == 0 {
            return Err(ConfigError::Invalid("max_timeout_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn is_excluded(&self, tool_name: &str) -> bool {
        self.excluded_tools.iter().any(|name| name == tool_name)
    }

    /// Timeout for a run, clamped to the configured maximum
    ///
    /// `None` and zero both select the default.
    pub fn resolve_timeout(&self, requested_secs: Option<u64>) -> Duration {
        let secs = match requested_secs {
            Some(secs) if secs > 0 => secs,
            _ => self.default_timeout_secs,
        };
        Duration::from_secs(secs.min(self.max_timeout_secs))
    }

    /// Sandbox limits for a run
    pub fn limits(&self, requested_secs: Option<u64>) -> SandboxLimits {
        SandboxLimits::new()
            .with_memory_bytes(self.memory_bytes)
            .with_timeout(self.resolve_timeout(requested_secs))
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_values() {
        let config = ExecutionConfig::default();
        assert_eq!(config.namespace, "mux");
        assert_eq!(config.memory_bytes, 64 * 1024 * 1024);
        assert_eq!(config.resolve_timeout(None), Duration::from_secs(300));
        assert!(config.is_excluded("code_execution"));
        assert!(config.is_excluded("status_set"));
        assert!(!config.is_excluded("file_read"));
    }

    #[test]
    fn test_timeout_clamping() {
        let config = ExecutionConfig::default();
        assert_eq!(config.resolve_timeout(Some(10)), Duration::from_secs(10));
        assert_eq!(config.resolve_timeout(Some(0)), Duration::from_secs(300));
        assert_eq!(config.resolve_timeout(Some(99_999)), Duration::from_secs(3600));
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config = ExecutionConfig::from_yaml_str("namespace: tools\nmax_timeout_secs: 60\n").unwrap();
        assert_eq!(config.namespace, "tools");
        assert_eq!(config.max_timeout_secs, 60);
        assert_eq!(config.default_timeout_secs, 300);
        assert_eq!(config.resolve_timeout(None), Duration::from_secs(60));
        assert_eq!(config.excluded_tools.len(), 6);
    }

    #[test]
    fn test_empty_yaml_is_default() {
        assert_eq!(ExecutionConfig::from_yaml_str("").unwrap(), ExecutionConfig::default());
    }

    #[test]
    fn test_invalid_namespace_rejected() {
        let err = ExecutionConfig::from_yaml_str("namespace: \"my-tools\"").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "memory_bytes: 1048576\nexcluded_tools: [bash]").unwrap();
        let config = ExecutionConfig::load(file.path()).unwrap();
        assert_eq!(config.memory_bytes, 1024 * 1024);
        assert_eq!(config.excluded_tools, vec!["bash".to_string()]);
        assert!(!config.is_excluded("code_execution"));
    }

    #[test]
    fn test_missing_file() {
        let err = ExecutionConfig::load("/nonexistent/toolscript.yml").unwrap_err();
        assert!(matches!(err, ConfigError::ReadError(_)));
    }
}
