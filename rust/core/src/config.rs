use crate::{Result, ScratchpadError};
use serde::{Deserialize, Serialize};

/// Process-local tunables for creating containers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScratchpadConfig {
    /// Prefix for generated segment names
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,

    /// Capacity multiplier applied when a vector overflows
    #[serde(default = "default_growth_ratio")]
    pub growth_ratio: f64,

    /// Minimum number of elements a new vector or array can hold
    #[serde(default = "default_min_elements")]
    pub min_elements: usize,

    /// Initial data capacity of a dictionary, in bytes
    #[serde(default = "default_dict_initial_capacity")]
    pub dict_initial_capacity: usize,

    /// Upper bound on any single segment, in bytes
    #[serde(default = "default_max_segment_size")]
    pub max_segment_size: usize,

    /// Whether a creator's container destroys its segments when dropped
    #[serde(default = "default_unlink_on_drop")]
    pub unlink_on_drop: bool,
}

fn default_name_prefix() -> String {
    "scp".to_string()
}

fn default_growth_ratio() -> f64 {
    2.0
}

fn default_min_elements() -> usize {
    2
}

fn default_dict_initial_capacity() -> usize {
    256
}

fn default_max_segment_size() -> usize {
    1024 * 1024 * 1024 // 1GB
}

fn default_unlink_on_drop() -> bool {
    true
}

impl Default for ScratchpadConfig {
    fn default() -> Self {
        Self {
            name_prefix: default_name_prefix(),
            growth_ratio: default_growth_ratio(),
            min_elements: default_min_elements(),
            dict_initial_capacity: default_dict_initial_capacity(),
            max_segment_size: default_max_segment_size(),
            unlink_on_drop: default_unlink_on_drop(),
        }
    }
}

impl ScratchpadConfig {
    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: ScratchpadConfig = toml::from_str(content)
            .map_err(|e| ScratchpadError::Deserialization(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ScratchpadError::Serialization(format!("config: {}", e)))
    }

    pub fn with_growth_ratio(mut self, ratio: f64) -> Self {
        self.growth_ratio = ratio;
        self
    }

    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    pub fn with_unlink_on_drop(mut self, unlink: bool) -> Self {
        self.unlink_on_drop = unlink;
        self
    }

    /// Reject values the containers cannot honor
    pub fn validate(&self) -> Result<()> {
        if !(self.growth_ratio > 1.0 && self.growth_ratio.is_finite()) {
            return Err(ScratchpadError::Value(format!(
                "growth ratio must be a finite number above 1, got {}",
                self.growth_ratio
            )));
        }
        if self.min_elements == 0 {
            return Err(ScratchpadError::Value("min_elements must be at least 1".to_string()));
        }
        if self.dict_initial_capacity == 0 {
            return Err(ScratchpadError::Value(
                "dict_initial_capacity must be at least 1 byte".to_string(),
            ));
        }
        // macOS caps shm names at 31 bytes
        if self.name_prefix.is_empty()
            || self.name_prefix.len() > 8
            || !self.name_prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(ScratchpadError::Value(format!(
                "name prefix {:?} must be 1-8 ASCII alphanumerics",
                self.name_prefix
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ScratchpadConfig::default();
        assert_eq!(config.name_prefix, "scp");
        assert_eq!(config.growth_ratio, 2.0);
        assert_eq!(config.min_elements, 2);
        assert!(config.unlink_on_drop);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = ScratchpadConfig::from_toml_str("growth_ratio = 1.5\nname_prefix = \"beam\"\n").unwrap();
        assert_eq!(config.growth_ratio, 1.5);
        assert_eq!(config.name_prefix, "beam");
        assert_eq!(config.dict_initial_capacity, 256);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = ScratchpadConfig::default().with_growth_ratio(3.0);
        let text = config.to_toml_string().unwrap();
        assert_eq!(ScratchpadConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_invalid_values() {
        assert!(ScratchpadConfig::default().with_growth_ratio(1.0).validate().is_err());
        assert!(ScratchpadConfig::default().with_growth_ratio(f64::NAN).validate().is_err());
        assert!(ScratchpadConfig::default().with_name_prefix("bad/name").validate().is_err());
        assert!(ScratchpadConfig::from_toml_str("min_elements = 0").is_err());
        assert!(ScratchpadConfig::from_toml_str("growth_ratio = \"fast\"").is_err());
    }
}
