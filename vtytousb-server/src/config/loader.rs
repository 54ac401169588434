//! Configuration loader
//!
//! Files are JSON objects. Fields missing from a file take their value from
//! the schema default, so a user may delete a line to reset it.

use std::path::Path;

use serde_json::Value;

use vtytousb_utils::{GatewayError, Result};

use super::schema::ConfigSchema;

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Read and parse a config file
    pub async fn load_from_path<T: ConfigSchema>(path: &Path, defaults: &T) -> Result<T> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GatewayError::FileRead {
                path: path.to_path_buf(),
                source: e,
            })?;
        Self::parse(&content, path, defaults)
    }

    /// Parse and validate configuration text
    ///
    /// `defaults` fills in any field the text leaves out.
    pub fn parse<T: ConfigSchema>(content: &str, path: &Path, defaults: &T) -> Result<T> {
        let invalid = |message: String| GatewayError::ConfigInvalid {
            path: path.to_path_buf(),
            message,
        };

        let parsed: Value = serde_json::from_str(content).map_err(|e| invalid(e.to_string()))?;
        let Value::Object(fields) = parsed else {
            return Err(invalid("expected a JSON object".into()));
        };

        let mut merged = serde_json::to_value(defaults).map_err(|e| invalid(e.to_string()))?;
        match merged {
            Value::Object(ref mut base) => base.extend(fields),
            _ => merged = Value::Object(fields),
        }

        let config: T = serde_json::from_value(merged).map_err(|e| invalid(e.to_string()))?;
        config.validate().map_err(invalid)?;
        Ok(config)
    }

    /// Serialize a value the way it is stored on disk
    pub fn render<T: ConfigSchema>(value: &T) -> Result<String> {
        let mut text = serde_json::to_string_pretty(value)
            .map_err(|e| GatewayError::config(format!("Failed to serialize config: {}", e)))?;
        text.push('\n');
        Ok(text)
    }

    /// Write a value to disk as pretty JSON
    pub async fn save<T: ConfigSchema>(path: &Path, value: &T) -> Result<()> {
        let text = Self::render(value)?;
        tokio::fs::write(path, text)
            .await
            .map_err(|e| GatewayError::FileWrite {
                path: path.to_path_buf(),
                source: e,
            })
    }
}
