// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

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
            title: "vulkan raytracer".to_string(),
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
    pub present_mode: String,
    /// GLSL compute kernel, compiled at startup and on hot reload
    pub kernel: String,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "mailbox".to_string(),
            kernel: "shaders/raytrace.comp".to_string(),
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            show_fps: true,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {}. Using defaults.", e);
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

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Get present mode as Vulkan enum
    pub fn get_present_mode(&self) -> ash::vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => ash::vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => ash::vk::PresentModeKHR::MAILBOX,
            "fifo" => ash::vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => ash::vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to MAILBOX",
                    self.graphics.present_mode
                );
                ash::vk::PresentModeKHR::MAILBOX
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let config: Config = toml::from_str("[window]\nwidth = 800\n").unwrap();

        assert_eq!(config.window.width, 800);
        assert_eq!(config.window.height, 720);
        assert_eq!(config.graphics.present_mode, "mailbox");
        assert_eq!(config.graphics.kernel, "shaders/raytrace.comp");
        assert!(config.debug.validation_layers);
    }

    #[test]
    fn present_mode_strings_map_to_vulkan_enums() {
        let mut config = Config::default();
        for (name, mode) in [
            ("mailbox", ash::vk::PresentModeKHR::MAILBOX),
            ("fifo", ash::vk::PresentModeKHR::FIFO),
            ("immediate", ash::vk::PresentModeKHR::IMMEDIATE),
            ("garbage", ash::vk::PresentModeKHR::MAILBOX),
        ] {
            config.graphics.present_mode = name.to_string();
            assert_eq!(config.get_present_mode(), mode);
        }
    }
}
