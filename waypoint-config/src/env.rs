// Environment variable loading

use crate::{ConfigError, Result};
use std::collections::HashMap;
use std::env;

/// Environment variable loader
pub struct EnvLoader {
    prefix: Option<String>,
}

impl EnvLoader {
    /// Create a new environment loader
    pub fn new(prefix: Option<String>) -> Self {
        Self { prefix }
    }

    /// Load environment variables, keyed by lowercase name with the prefix stripped
    pub fn load(&self) -> Result<HashMap<String, String>> {
        Ok(self.collect(env::vars()))
    }

    fn collect(&self, vars: impl IntoIterator<Item = (String, String)>) -> HashMap<String, String> {
        let mut config = HashMap::new();

        for (key, value) in vars {
            match self.prefix {
                Some(ref prefix) => {
                    if let Some(rest) = key.strip_prefix(prefix.as_str())
                        && let Some(trimmed) = rest.strip_prefix('_')
                        && !trimmed.is_empty()
                    {
                        config.insert(trimmed.to_lowercase(), value);
                    }
                }
                None => {
                    config.insert(key.to_lowercase(), value);
                }
            }
        }

        config
    }

    /// Load a specific environment variable
    pub fn load_var(&self, key: &str) -> Result<String> {
        let full_key = match self.prefix {
            Some(ref prefix) => format!("{}_{}", prefix, key.to_uppercase()),
            None => key.to_uppercase(),
        };

        env::var(&full_key).map_err(|source| ConfigError::Env {
            key: full_key.clone(),
            source,
        })
    }

    /// Load with default value
    pub fn load_var_or(&self, key: &str, default: &str) -> String {
        self.load_var(key).unwrap_or_else(|_| default.to_string())
    }
}

impl Default for EnvLoader {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // std::env::set_var is unsafe under edition 2024, so prefix handling is
    // exercised through `collect` with synthetic variables.

    #[test]
    fn test_collect_strips_prefix() {
        let loader = EnvLoader::new(Some("WAYPOINT".to_string()));
        let vars = vec![
            ("WAYPOINT_DRIVER".to_string(), "etcd".to_string()),
            ("WAYPOINT_TIMEOUT".to_string(), "3".to_string()),
            ("WAYPOINTX_OTHER".to_string(), "skip".to_string()),
            ("PATH".to_string(), "/usr/bin".to_string()),
        ];

        let config = loader.collect(vars);
        assert_eq!(config.len(), 2);
        assert_eq!(config.get("driver"), Some(&"etcd".to_string()));
        assert_eq!(config.get("timeout"), Some(&"3".to_string()));
    }

    #[test]
    fn test_collect_without_prefix() {
        let loader = EnvLoader::default();
        let config = loader.collect(vec![("HOME".to_string(), "/root".to_string())]);
        assert_eq!(config.get("home"), Some(&"/root".to_string()));
    }

    #[test]
    fn test_env_loader_with_default() {
        let loader = EnvLoader::new(None);
        let value = loader.load_var_or("NONEXISTENT_VAR_12345", "default");

        assert_eq!(value, "default");
    }

    #[test]
    fn test_env_loader_missing_var() {
        let loader = EnvLoader::new(Some("WAYPOINT_TEST".to_string()));
        let result = loader.load_var("MISSING_VAR_67890");

        assert!(matches!(
            result,
            Err(ConfigError::Env { ref key, .. }) if key == "WAYPOINT_TEST_MISSING_VAR_67890"
        ));
    }
}
