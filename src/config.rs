//! Configuration for the voxlink client
//!
//! Precedence: CLI flags (with env fallbacks, handled by clap) override the
//! optional TOML config file, which overrides built-in defaults. The file is
//! a partial overlay; every field is optional.

use std::path::PathBuf;

use directories::ProjectDirs;
use serde::Deserialize;

use crate::{Error, Result};

/// Default streaming endpoint
pub const DEFAULT_ENDPOINT: &str = "ws://127.0.0.1:8000/ws/audio";

/// Default capture frame cadence in milliseconds
pub const DEFAULT_FRAME_MS: u32 = 100;

/// Resolved client configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// WebSocket endpoint of the streaming service
    pub endpoint: String,

    /// Project identifier sent with every utterance
    pub project: String,

    /// Optional avatar/voice identifier
    pub avatar: Option<String>,

    /// Optional recognition language hint
    pub language: Option<String>,

    /// Capture pipeline configuration
    pub capture: CaptureConfig,

    /// Playback pipeline configuration
    pub playback: PlaybackConfig,
}

/// Capture device configuration
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Input device name; `None` selects the system default
    pub device: Option<String>,

    /// Frame cadence in milliseconds
    pub frame_ms: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: None,
            frame_ms: DEFAULT_FRAME_MS,
        }
    }
}

/// Playback device configuration
#[derive(Debug, Clone, Default)]
pub struct PlaybackConfig {
    /// Output device name; `None` selects the system default
    pub device: Option<String>,
}

/// CLI-sourced overrides applied on top of the config file
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub endpoint: Option<String>,
    pub project: Option<String>,
    pub avatar: Option<String>,
    pub language: Option<String>,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
}

impl Config {
    /// Resolve configuration from the standard file plus CLI overrides.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if no project identifier is configured
    /// anywhere.
    pub fn resolve(overrides: Overrides) -> Result<Self> {
        let file = load_config_file();
        Self::from_parts(file, overrides)
    }

    fn from_parts(file: ConfigFile, overrides: Overrides) -> Result<Self> {
        let project = overrides
            .project
            .or(file.project)
            .ok_or_else(|| Error::Config("no project configured".to_string()))?;
        if project.trim().is_empty() {
            return Err(Error::Config("project must not be empty".to_string()));
        }

        Ok(Self {
            endpoint: overrides
                .endpoint
                .or(file.endpoint)
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            project,
            avatar: overrides.avatar.or(file.avatar),
            language: overrides.language.or(file.language),
            capture: CaptureConfig {
                device: overrides.input_device.or(file.capture.device),
                frame_ms: file.capture.frame_ms.unwrap_or(DEFAULT_FRAME_MS),
            },
            playback: PlaybackConfig {
                device: overrides.output_device.or(file.playback.device),
            },
        })
    }
}

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    endpoint: Option<String>,

    #[serde(default)]
    project: Option<String>,

    #[serde(default)]
    avatar: Option<String>,

    #[serde(default)]
    language: Option<String>,

    #[serde(default)]
    capture: CaptureFileConfig,

    #[serde(default)]
    playback: PlaybackFileConfig,
}

#[derive(Debug, Default, Deserialize)]
struct CaptureFileConfig {
    device: Option<String>,
    frame_ms: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct PlaybackFileConfig {
    device: Option<String>,
}

/// Standard config file location (`…/voxlink/config.toml`)
fn config_file_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "voxlink").map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Load the TOML config file, falling back to defaults on any problem
fn load_config_file() -> ConfigFile {
    let Some(path) = config_file_path() else {
        return ConfigFile::default();
    };

    if !path.exists() {
        return ConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                ConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            ConfigFile::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_win_over_file_values() {
        let file: ConfigFile = toml::from_str(
            r#"
            endpoint = "ws://file.example/ws/audio"
            project = "file-project"
            language = "de"

            [capture]
            frame_ms = 20
            "#,
        )
        .unwrap();

        let config = Config::from_parts(
            file,
            Overrides {
                endpoint: Some("ws://cli.example/ws/audio".to_string()),
                avatar: Some("a1".to_string()),
                ..Overrides::default()
            },
        )
        .unwrap();

        assert_eq!(config.endpoint, "ws://cli.example/ws/audio");
        assert_eq!(config.project, "file-project");
        assert_eq!(config.avatar.as_deref(), Some("a1"));
        assert_eq!(config.language.as_deref(), Some("de"));
        assert_eq!(config.capture.frame_ms, 20);
    }

    #[test]
    fn missing_project_is_a_config_error() {
        let result = Config::from_parts(ConfigFile::default(), Overrides::default());
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn defaults_fill_unset_fields() {
        let config = Config::from_parts(
            ConfigFile::default(),
            Overrides {
                project: Some("p1".to_string()),
                ..Overrides::default()
            },
        )
        .unwrap();

        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.capture.frame_ms, DEFAULT_FRAME_MS);
        assert!(config.capture.device.is_none());
        assert!(config.playback.device.is_none());
    }
}
