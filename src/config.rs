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
    pub device: DeviceConfig,
    pub render: RenderConfig,
    pub sync: SyncConfig,
    pub debug: DebugConfig,
    pub shaders: ShaderConfig,
}

/// Instance and device settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub app_name: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            app_name: "vk-cmdlist demo".to_string(),
        }
    }
}

/// Offscreen frame loop settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub width: u32,
    pub height: u32,
    pub frame_count: u32,
    pub clear_color: [f32; 4],
    pub depth: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            frame_count: 60,
            clear_color: [0.1, 0.2, 0.8, 1.0],
            depth: true,
        }
    }
}

/// Frame pacing and upload settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How long the CPU waits on the submit timeline per frame
    pub frame_timeout_ms: u64,
    pub staging_buffer_size: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            frame_timeout_ms: 1000,
            staging_buffer_size: 64 * 1024,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_level: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: cfg!(debug_assertions),
            log_level: "info".to_string(),
        }
    }
}

/// Compiled SPIR-V locations. Drawing is skipped if they cannot be loaded.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ShaderConfig {
    pub vertex: String,
    pub fragment: String,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            vertex: "shaders/triangle.vert.spv".to_string(),
            fragment: "shaders/triangle.frag.spv".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
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

    /// Get the log level as a filter
    pub fn log_level_filter(&self) -> log::LevelFilter {
        match self.debug.log_level.to_lowercase().as_str() {
            "off" => log::LevelFilter::Off,
            "error" => log::LevelFilter::Error,
            "warn" => log::LevelFilter::Warn,
            "info" => log::LevelFilter::Info,
            "debug" => log::LevelFilter::Debug,
            "trace" => log::LevelFilter::Trace,
            _ => {
                log::warn!(
                    "Unknown log level '{}', defaulting to info",
                    self.debug.log_level
                );
                log::LevelFilter::Info
            }
        }
    }

    pub fn frame_timeout_nanos(&self) -> u64 {
        self.sync.frame_timeout_ms.saturating_mul(1_000_000)
    }
}
