//! Configuration system
//!
//! Any serde-serializable settings type can implement [`Config`] to get
//! TOML/RON loading and saving keyed on the file extension.

pub use serde::{Deserialize, Serialize};

/// Configuration trait
pub trait Config: Serialize + for<'de> Deserialize<'de> + Default {
    /// Load configuration from file
    fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;

        // Try different formats
        if path.ends_with(".toml") {
            toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
        } else if path.ends_with(".ron") {
            ron::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
        } else {
            Err(ConfigError::UnsupportedFormat(path.to_string()))
        }
    }

    /// Save configuration to file
    fn save_to_file(&self, path: &str) -> Result<(), ConfigError> {
        let contents = if path.ends_with(".toml") {
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?
        } else if path.ends_with(".ron") {
            ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
                .map_err(|e| ConfigError::Serialize(e.to_string()))?
        } else {
            return Err(ConfigError::UnsupportedFormat(path.to_string()));
        };

        std::fs::write(path, contents).map_err(ConfigError::Io)
    }
}

/// Configuration errors
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialize(String),

    /// Unsupported format
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
}

/// # Device Context Configuration
///
/// Instance metadata, validation and queue-family preferences used when a
/// [`DeviceContext`](crate::context::DeviceContext) is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Application name for Vulkan instance creation
    pub application_name: String,
    /// Whether to enable Vulkan validation layers (`None` = debug builds only)
    pub enable_validation: Option<bool>,
    /// Force a physical device by enumeration index
    pub device_index: Option<usize>,
    /// Prefer a compute family without graphics support when one exists
    pub prefer_dedicated_compute: bool,
    /// Prefer a transfer-only family when one exists
    pub prefer_dedicated_transfer: bool,
}

impl ContextConfig {
    /// Create a new context configuration
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            application_name: app_name.into(),
            enable_validation: None,
            device_index: None,
            prefer_dedicated_compute: true,
            prefer_dedicated_transfer: true,
        }
    }

    /// Enable or disable validation layers
    #[must_use]
    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.enable_validation = Some(enabled);
        self
    }

    /// Select the physical device by index
    #[must_use]
    pub fn with_device_index(mut self, index: usize) -> Self {
        self.device_index = Some(index);
        self
    }

    /// Control whether compute and transfer get their own families
    #[must_use]
    pub fn with_dedicated_queues(mut self, compute: bool, transfer: bool) -> Self {
        self.prefer_dedicated_compute = compute;
        self.prefer_dedicated_transfer = transfer;
        self
    }

    /// Whether validation ends up enabled for this build
    pub fn validation_enabled(&self) -> bool {
        self.enable_validation.unwrap_or(cfg!(debug_assertions))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.application_name.is_empty() {
            return Err("Application name cannot be empty".to_string());
        }
        if self.application_name.contains('\0') {
            return Err("Application name cannot contain NUL bytes".to_string());
        }
        Ok(())
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self::new("vk_frame application")
    }
}

impl Config for ContextConfig {}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> String {
        let mut path = std::env::temp_dir();
        path.push(format!("vk_frame_{}_{}", std::process::id(), name));
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_default_prefers_dedicated_queues() {
        let config = ContextConfig::default();
        assert!(config.prefer_dedicated_compute);
        assert!(config.prefer_dedicated_transfer);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_follows_build_type_when_unset() {
        let config = ContextConfig::new("app");
        assert_eq!(config.validation_enabled(), cfg!(debug_assertions));
        assert!(!config.with_validation(false).validation_enabled());
    }

    #[test]
    fn test_empty_name_rejected() {
        assert!(ContextConfig::new("").validate().is_err());
        assert!(ContextConfig::new("a\0b").validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let path = temp_path("context.toml");
        let config = ContextConfig::new("toml app")
            .with_device_index(1)
            .with_dedicated_queues(false, true);
        config.save_to_file(&path).unwrap();

        let loaded = ContextConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.application_name, "toml app");
        assert_eq!(loaded.device_index, Some(1));
        assert!(!loaded.prefer_dedicated_compute);
        assert!(loaded.prefer_dedicated_transfer);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_ron_round_trip() {
        let path = temp_path("context.ron");
        let config = ContextConfig::new("ron app").with_validation(true);
        config.save_to_file(&path).unwrap();

        let loaded = ContextConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.application_name, "ron app");
        assert_eq!(loaded.enable_validation, Some(true));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let loaded: ContextConfig = toml::from_str("application_name = \"partial\"").unwrap();
        assert_eq!(loaded.application_name, "partial");
        assert!(loaded.prefer_dedicated_transfer);
        assert_eq!(loaded.device_index, None);
    }

    #[test]
    fn test_unsupported_extension() {
        let result = ContextConfig::default().save_to_file("settings.json");
        assert!(matches!(result, Err(ConfigError::UnsupportedFormat(_))));
    }
}
