//! Simple configuration persistence for riff
//!
//! Stores the last opened file, where exports go, and the engine timings a
//! user may want to tune.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

const DEFAULT_CROSSFADE_MS: f32 = 30.0;
const DEFAULT_WATCHDOG_MS: u64 = 500;

/// Player configuration
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerConfig {
    /// File opened most recently, reopened when no path is given
    pub last_file: Option<PathBuf>,
    /// Loop seam crossfade in milliseconds
    pub crossfade_ms: f32,
    /// Render stall deadline in milliseconds
    pub watchdog_ms: u64,
    /// Directory for WAV exports
    pub export_dir: Option<PathBuf>,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            last_file: None,
            crossfade_ms: DEFAULT_CROSSFADE_MS,
            watchdog_ms: DEFAULT_WATCHDOG_MS,
            export_dir: None,
        }
    }
}

impl PlayerConfig {
    /// Load config from the default location
    ///
    /// Returns default config if file doesn't exist or can't be parsed.
    pub fn load() -> Self {
        let path = Self::config_path();
        Self::load_from(&path).unwrap_or_default()
    }

    /// Load config from a specific path
    pub fn load_from(path: &Path) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(Self::parse(&content))
    }

    /// Save config to the default location
    pub fn save(&self) -> io::Result<()> {
        let path = Self::config_path();
        self.save_to(&path)
    }

    /// Save config to a specific path
    pub fn save_to(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.serialize())
    }

    /// Get the default config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("riff")
            .join("config.txt")
    }

    /// Export directory, falling back to the platform audio dir, then home
    pub fn export_dir_or_default(&self) -> PathBuf {
        self.export_dir
            .clone()
            .or_else(dirs::audio_dir)
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Parse config from simple key=value format
    fn parse(content: &str) -> Self {
        let mut config = Self::default();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();

            match key {
                "last_file" if !value.is_empty() => {
                    config.last_file = Some(PathBuf::from(value));
                }
                "export_dir" if !value.is_empty() => {
                    config.export_dir = Some(PathBuf::from(value));
                }
                "crossfade_ms" => match value.parse::<f32>() {
                    Ok(ms) if ms.is_finite() && ms > 0.0 => config.crossfade_ms = ms,
                    _ => warn!(value, "ignoring invalid crossfade_ms"),
                },
                "watchdog_ms" => match value.parse::<u64>() {
                    Ok(ms) if ms > 0 => config.watchdog_ms = ms,
                    _ => warn!(value, "ignoring invalid watchdog_ms"),
                },
                _ => {} // Ignore unknown keys
            }
        }

        config
    }

    /// Serialize config to simple key=value format
    fn serialize(&self) -> String {
        let mut lines = vec![
            "# riff configuration".to_string(),
            format!("crossfade_ms={}", self.crossfade_ms),
            format!("watchdog_ms={}", self.watchdog_ms),
        ];

        if let Some(ref file) = self.last_file {
            lines.push(format!("last_file={}", file.display()));
        }
        if let Some(ref dir) = self.export_dir {
            lines.push(format!("export_dir={}", dir.display()));
        }

        lines.join("\n")
    }
}
