// Configuration management for Waypoint

pub mod env;
pub mod error;
pub mod loader;
pub mod validation;

pub use env::EnvLoader;
pub use error::{ConfigError, Result};
pub use loader::{ConfigLoader, FileFormat};
pub use validation::{ConfigValidator, Validate};

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::path::Path;

/// Layered configuration: files first, then environment overrides.
#[derive(Debug, Clone, Default)]
pub struct ConfigManager {
    values: Map<String, Value>,
    env_prefix: Option<String>,
}

impl ConfigManager {
    /// Create a new configuration manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with environment variable prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            values: Map::new(),
            env_prefix: Some(prefix.into()),
        }
    }

    /// Load a file, detecting the format from its extension
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let loader = ConfigLoader::auto(path.as_ref())?;
        let data = loader.load_file(path)?;
        self.merge_value(data)
    }

    /// Load a file with an explicit format
    pub fn load_file_as(&mut self, path: impl AsRef<Path>, format: FileFormat) -> Result<()> {
        let data = ConfigLoader::new(format).load_file(path)?;
        self.merge_value(data)
    }

    /// Parse configuration from a string
    pub fn load_str(&mut self, content: &str, format: FileFormat) -> Result<()> {
        let data = ConfigLoader::new(format).parse(content)?;
        self.merge_value(data)
    }

    /// Load a `.env` file into the process environment, then apply overrides
    pub fn load_dotenv(&mut self, path: Option<&str>) -> Result<()> {
        if let Some(path) = path {
            dotenvy::from_path(path)?;
        } else {
            dotenvy::dotenv().ok();
        }
        self.load_env()
    }

    /// Apply environment variables as top-level overrides.
    ///
    /// Values that parse as JSON (numbers, booleans, arrays) keep their type,
    /// anything else is taken as a string.
    pub fn load_env(&mut self) -> Result<()> {
        let loader = EnvLoader::new(self.env_prefix.clone());
        for (key, raw) in loader.load()? {
            self.values.insert(key, parse_env_value(&raw));
        }
        Ok(())
    }

    fn merge_value(&mut self, data: Value) -> Result<()> {
        match data {
            Value::Object(map) => {
                for (key, value) in map {
                    self.values.insert(key, value);
                }
                Ok(())
            }
            other => Err(ConfigError::NotATable(other.to_string())),
        }
    }

    /// Set a configuration value
    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.values.insert(key.to_string(), value.into());
    }

    /// Get a configuration value
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .values
            .get(key)
            .ok_or_else(|| ConfigError::MissingKey(key.to_string()))?;

        serde_json::from_value(value.clone()).map_err(|source| ConfigError::Decode {
            key: key.to_string(),
            source,
        })
    }

    /// Get a configuration value with default
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    /// Check if a key exists
    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Get all configuration keys
    pub fn keys(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }

    /// Deserialize the whole configuration and validate it
    pub fn load_validated<T: DeserializeOwned + Validate>(&self) -> Result<T> {
        let validated: T = serde_json::from_value(Value::Object(self.values.clone()))
            .map_err(|source| ConfigError::Decode {
                key: "configuration".to_string(),
                source,
            })?;

        validated.validate()?;

        Ok(validated)
    }
}

fn parse_env_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
