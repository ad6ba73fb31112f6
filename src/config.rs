//! Tunables for the execution core.

use serde::Deserialize;

use crate::error::{Error, Result};

/// Configuration shared by every cursor of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Compute column display widths by scanning every row. Costly on large results.
    pub display_size: bool,
    /// Chunk size used when reading from a copy source.
    pub copy_chunk_size: usize,
    /// Maximum line length read at a time from an old-style copy stream.
    pub copy_line_buffer: usize,
    /// Number of notices retained on the connection (oldest dropped first).
    pub max_notices: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            display_size: false,
            copy_chunk_size: 8192,
            copy_line_buffer: 4096,
            max_notices: 50,
        }
    }
}

impl CoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a JSON object; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: CoreConfig = serde_json::from_str(json)
            .map_err(|e| Error::interface(format!("invalid configuration: {}", e)))?;
        if config.copy_chunk_size == 0 || config.copy_line_buffer < 2 {
            return Err(Error::interface("copy buffer sizes must be positive"));
        }
        Ok(config)
    }

    /// Enable the display-size scan.
    pub fn display_size(mut self, enabled: bool) -> Self {
        self.display_size = enabled;
        self
    }

    pub fn copy_chunk_size(mut self, size: usize) -> Self {
        self.copy_chunk_size = size.max(1);
        self
    }

    pub fn copy_line_buffer(mut self, size: usize) -> Self {
        self.copy_line_buffer = size.max(2);
        self
    }

    pub fn max_notices(mut self, n: usize) -> Self {
        self.max_notices = n;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = CoreConfig::default();
        assert!(!config.display_size);
        assert_eq!(config.copy_chunk_size, 8192);
        assert_eq!(config.copy_line_buffer, 4096);
        assert_eq!(config.max_notices, 50);
    }

    #[test]
    fn test_from_json_partial() {
        let config = CoreConfig::from_json(r#"{"display_size": true, "max_notices": 5}"#).unwrap();
        assert_eq!(
            config,
            CoreConfig::new().display_size(true).max_notices(5)
        );
    }

    #[test]
    fn test_from_json_rejects_zero_chunk() {
        let err = CoreConfig::from_json(r#"{"copy_chunk_size": 0}"#).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Interface);
        assert!(CoreConfig::from_json("not json").is_err());
    }
}
