//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// How work items are laid out under the source root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceLayout {
    /// Each item is a DVD image directory; units are disc titles.
    Disc,
    /// Each item is a directory of loose media files; units are files.
    Files,
}

impl std::fmt::Display for SourceLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceLayout::Disc => write!(f, "disc"),
            SourceLayout::Files => write!(f, "files"),
        }
    }
}

impl std::str::FromStr for SourceLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "disc" | "dvd" => Ok(SourceLayout::Disc),
            "files" | "file" => Ok(SourceLayout::Files),
            other => Err(format!("unknown source layout '{}'", other)),
        }
    }
}

/// Transcoding engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Engine executable, resolved through PATH when not absolute
    #[serde(default = "default_engine_program")]
    pub program: String,
    /// Kill a unit's process after this many seconds without output (0 = wait forever)
    #[serde(default)]
    pub stall_timeout_secs: u64,
}

fn default_engine_program() -> String {
    "HandBrakeCLI".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: default_engine_program(),
            stall_timeout_secs: 0,
        }
    }
}

/// Work discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoveryConfig {
    /// Source layout; when unset the CLI picks one from the invocation shape
    #[serde(default)]
    pub layout: Option<SourceLayout>,
    /// Media extensions recognised in the files layout (case-insensitive, with leading dot)
    #[serde(default = "default_media_extensions")]
    pub media_extensions: Vec<String>,
    /// Subdirectory name that marks a DVD image directory
    #[serde(default = "default_disc_marker")]
    pub disc_marker: String,
}

fn default_media_extensions() -> Vec<String> {
    [".mpg", ".m4v", ".mov", ".mp4"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_disc_marker() -> String {
    "VIDEO_TS".to_string()
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            layout: None,
            media_extensions: default_media_extensions(),
            disc_marker: default_disc_marker(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - MP4_BATCH_ENGINE -> engine.program
    /// - MP4_BATCH_STALL_TIMEOUT_SECS -> engine.stall_timeout_secs
    /// - MP4_BATCH_LAYOUT -> discovery.layout
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("MP4_BATCH_ENGINE") {
            if !val.trim().is_empty() {
                self.engine.program = val;
            }
        }

        if let Ok(val) = env::var("MP4_BATCH_STALL_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.engine.stall_timeout_secs = secs;
            }
        }

        if let Ok(val) = env::var("MP4_BATCH_LAYOUT") {
            // Invalid value, keep existing
            if let Ok(layout) = val.parse::<SourceLayout>() {
                self.discovery.layout = Some(layout);
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`Config::load`], but falls back to defaults when no file is given
    pub fn load_or_default<P: AsRef<Path>>(path: Option<P>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let mut config = Self::default();
                config.apply_env_overrides();
                Ok(config)
            }
        }
    }
}
