//! Messenger configuration.
//!
//! Loaded from YAML files and environment variables into a single
//! [`MessengerConfig`] consumed by [`crate::messenger::init_messenger`].

mod messaging;

pub use messaging::{EventHubConfig, KafkaConfig, LocalConfig, MessengerConfig, MessengerType};

use crate::messenger::{MessengerError, Result};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "messenger.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "MESSENGER_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "MESSENGER";

impl MessengerConfig {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `messenger.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix, `__` separated
    ///    (`MESSENGER__KAFKA__BOOTSTRAP_SERVERS`)
    pub fn load(path: Option<&str>) -> Result<Self> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| MessengerError::Config(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| MessengerError::Config(e.to_string()))
    }

    /// Parse configuration from a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| MessengerError::Config(e.to_string()))
    }
}
