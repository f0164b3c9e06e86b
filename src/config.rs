// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Sensible defaults apply when the file is missing or malformed. Command-line
// flags (see cli.rs) are layered on top after loading.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Smallest and largest number of frames the engine keeps in flight.
pub const MIN_FRAMES_IN_FLIGHT: usize = 2;
pub const MAX_FRAMES_IN_FLIGHT: usize = 3;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Frame Pacer".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub vsync: bool,
    pub allow_tearing: bool,
    pub clear_color: [f32; 4],
    pub frames_in_flight: usize,
    pub use_software_adapter: bool,
    pub shader_dir: PathBuf,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            vsync: true,
            allow_tearing: true,
            clear_color: [0.4, 0.6, 0.9, 1.0],
            frames_in_flight: MAX_FRAMES_IN_FLIGHT,
            use_software_adapter: false,
            shader_dir: PathBuf::from("shaders"),
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "frame_pacer.log".to_string(),
            show_fps: true,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        Self::load_from_path(path).unwrap_or_else(|e| {
            log::warn!("Failed to load {:?}: {:#}. Using defaults.", path, e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Parse configuration text
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Frames in flight, clamped to what the engine supports.
    ///
    /// The presentation chain is created with exactly this many images.
    pub fn frames_in_flight(&self) -> usize {
        let requested = self.graphics.frames_in_flight;
        let clamped = requested.clamp(MIN_FRAMES_IN_FLIGHT, MAX_FRAMES_IN_FLIGHT);
        if clamped != requested {
            log::warn!(
                "frames_in_flight = {} is out of range, using {}",
                requested,
                clamped
            );
        }
        clamped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.window.width, 1280);
        assert_eq!(config.window.height, 720);
        assert_eq!(config.graphics.frames_in_flight, 3);
        assert!(config.graphics.vsync);
        assert!(!config.graphics.use_software_adapter);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config = Config::parse(
            r#"
            [window]
            width = 1920

            [graphics]
            vsync = false
            clear_color = [0.0, 0.0, 0.0, 1.0]
            "#,
        )
        .unwrap();

        assert_eq!(config.window.width, 1920);
        assert_eq!(config.window.height, 720);
        assert!(!config.graphics.vsync);
        assert_eq!(config.graphics.clear_color, [0.0, 0.0, 0.0, 1.0]);
        assert_eq!(config.graphics.shader_dir, PathBuf::from("shaders"));
    }

    #[test]
    fn malformed_file_is_an_error() {
        assert!(Config::parse("[window]\nwidth = \"wide\"").is_err());
    }

    #[test]
    fn frames_in_flight_is_clamped() {
        let mut config = Config::default();
        config.graphics.frames_in_flight = 8;
        assert_eq!(config.frames_in_flight(), MAX_FRAMES_IN_FLIGHT);
        config.graphics.frames_in_flight = 0;
        assert_eq!(config.frames_in_flight(), MIN_FRAMES_IN_FLIGHT);
    }

    #[test]
    fn shipped_config_parses() {
        let config = Config::parse(include_str!("../config.toml")).unwrap();
        assert_eq!(config.frames_in_flight(), 3);
        assert_eq!(config.debug.log_file, "frame_pacer.log");
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load("definitely/not/here/config.toml");
        assert_eq!(config.window.title, "Frame Pacer");
    }
}
