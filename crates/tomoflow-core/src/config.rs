use std::path::Path;

use serde::de::DeserializeOwned;

use crate::error::{ReconError, Result};

/// Keyed lookup over a JSON configuration file.
///
/// Every stage reads its settings through this reader at construction time;
/// a missing or malformed key is fatal for the stage being built.
#[derive(Debug, Clone)]
pub struct ConfigReader {
    root: serde_json::Value,
}

impl ConfigReader {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            ReconError::Config(format!("could not read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&data)
    }

    pub fn from_json_str(data: &str) -> Result<Self> {
        let root: serde_json::Value = serde_json::from_str(data)
            .map_err(|e| ReconError::Config(format!("invalid JSON: {e}")))?;
        if !root.is_object() {
            return Err(ReconError::Config(
                "top-level config value must be an object".into(),
            ));
        }
        Ok(Self { root })
    }

    /// Look up `key` and deserialize it into `T`.
    pub fn lookup<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .root
            .get(key)
            .ok_or_else(|| ReconError::Config(format!("missing key `{key}`")))?;
        let parsed = serde_json::from_value(value.clone())
            .map_err(|e| ReconError::Config(format!("key `{key}`: {e}")))?;
        tracing::debug!(key, value = %value, "config lookup");
        Ok(parsed)
    }

    /// Like [`lookup`](Self::lookup) but falls back to `default` when the key
    /// is absent. A present-but-malformed key is still an error.
    pub fn lookup_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T> {
        match self.root.get(key) {
            None => Ok(default),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| ReconError::Config(format!("key `{key}`: {e}"))),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.root.get(key).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "samplingRate": 25,
        "scanRate": 1000,
        "maskTable": "mask.bin",
        "defectDetectors": [3, 77]
    }"#;

    #[test]
    fn lookup_typed_values() {
        let cfg = ConfigReader::from_json_str(SAMPLE).unwrap();
        assert_eq!(cfg.lookup::<u32>("samplingRate").unwrap(), 25);
        assert_eq!(cfg.lookup::<String>("maskTable").unwrap(), "mask.bin");
        assert_eq!(cfg.lookup::<Vec<usize>>("defectDetectors").unwrap(), vec![3, 77]);
    }

    #[test]
    fn missing_key_is_config_error() {
        let cfg = ConfigReader::from_json_str(SAMPLE).unwrap();
        let err = cfg.lookup::<u32>("numberOfPixels").unwrap_err();
        assert!(err.to_string().contains("numberOfPixels"));
    }

    #[test]
    fn malformed_key_is_config_error() {
        let cfg = ConfigReader::from_json_str(SAMPLE).unwrap();
        assert!(cfg.lookup::<u32>("maskTable").is_err());
    }

    #[test]
    fn lookup_or_defaults_only_when_absent() {
        let cfg = ConfigReader::from_json_str(SAMPLE).unwrap();
        assert_eq!(cfg.lookup_or::<u32>("timeout", 10).unwrap(), 10);
        assert_eq!(cfg.lookup_or::<u32>("samplingRate", 99).unwrap(), 25);
        assert!(cfg.lookup_or::<u32>("maskTable", 1).is_err());
    }

    #[test]
    fn non_object_root_rejected() {
        assert!(ConfigReader::from_json_str("[1, 2, 3]").is_err());
    }
}
