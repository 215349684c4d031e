//! `AppConfig`: the deserialized form of the JSON config file, with typed
//! fields for every recognized key plus environment variable overrides
//! (`PLEX_URL`, `PLEX_TOKEN`, `ENABLE_PLEX_NOTIFICATIONS`). Reads fall back
//! to defaults when the file is absent rather than failing.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

fn default_max_cpu_percent() -> f32 {
    80.0
}
fn default_max_memory_percent() -> f32 {
    85.0
}
fn default_max_load_average() -> f32 {
    8.0
}
fn default_min_available_memory_gb() -> f32 {
    2.0
}
fn default_max_parallel_jobs() -> usize {
    4
}
fn default_ramp_up_interval() -> u64 {
    60
}
fn default_check_interval() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LibraryDirs {
    #[serde(default)]
    pub tv: Option<String>,
    #[serde(default)]
    pub movies: Option<String>,
    #[serde(default)]
    pub music: Option<String>,
    #[serde(default)]
    pub misc: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PlexIntegration {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    /// Maps a local path prefix to the prefix Plex expects (network-mount
    /// remapping), e.g. `{"/mnt/tv": "\\\\server\\tv"}`.
    #[serde(default)]
    pub path_mappings: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AppConfig {
    #[serde(default = "default_max_cpu_percent")]
    pub max_cpu_percent: f32,
    #[serde(default = "default_max_memory_percent")]
    pub max_memory_percent: f32,
    #[serde(default = "default_max_load_average")]
    pub max_load_average: f32,
    #[serde(default = "default_min_available_memory_gb")]
    pub min_available_memory_gb: f32,
    #[serde(default = "default_max_parallel_jobs")]
    pub max_parallel_jobs: usize,
    #[serde(default = "default_ramp_up_interval")]
    pub ramp_up_interval: u64,
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,
    #[serde(default)]
    pub plex_priority: bool,
    #[serde(default)]
    pub download_priority: bool,
    #[serde(default)]
    pub target_directories: Vec<String>,
    #[serde(default)]
    pub pause_for_processes: Vec<String>,
    #[serde(default)]
    pub library_dirs: Option<LibraryDirs>,
    #[serde(default)]
    pub plex_integration: PlexIntegration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_cpu_percent: default_max_cpu_percent(),
            max_memory_percent: default_max_memory_percent(),
            max_load_average: default_max_load_average(),
            min_available_memory_gb: default_min_available_memory_gb(),
            max_parallel_jobs: default_max_parallel_jobs(),
            ramp_up_interval: default_ramp_up_interval(),
            check_interval: default_check_interval(),
            plex_priority: false,
            download_priority: false,
            target_directories: Vec::new(),
            pause_for_processes: Vec::new(),
            library_dirs: None,
            plex_integration: PlexIntegration::default(),
        }
    }
}

impl AppConfig {
    /// Loads the config file if present, falling back to defaults, then
    /// applies environment variable overrides for the Plex notifier.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(path) if path.exists() => read_json_file(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            _ => AppConfig::default(),
        };
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("PLEX_URL") {
            self.plex_integration.url = Some(url);
        }
        if let Ok(token) = std::env::var("PLEX_TOKEN") {
            self.plex_integration.token = Some(token);
        }
    }

    /// Truthy parsing: `true|yes|1|on` (case-insensitive).
    pub fn notifications_enabled(&self) -> bool {
        match std::env::var("ENABLE_PLEX_NOTIFICATIONS") {
            Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "true" | "yes" | "1" | "on"),
            Err(_) => false,
        }
    }
}

fn read_json_file<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&data).with_context(|| format!("failed to parse {}", path.display()))
}

/// Default config file search path: `./mediabox.config.json`.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("mediabox.config.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_permissive_but_bounded() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.max_parallel_jobs, 4);
        assert!(cfg.max_cpu_percent > 0.0);
    }

    #[test]
    fn notifications_disabled_by_default() {
        // SAFETY: test-only removal of an env var this process set, not
        // touching unrelated environment state.
        unsafe {
            std::env::remove_var("ENABLE_PLEX_NOTIFICATIONS");
        }
        let cfg = AppConfig::default();
        assert!(!cfg.notifications_enabled());
    }

    #[test]
    fn load_missing_file_falls_back_to_defaults() {
        let cfg = AppConfig::load(Some(Path::new("/nonexistent/mediabox.config.json"))).unwrap();
        assert_eq!(cfg.max_parallel_jobs, default_max_parallel_jobs());
    }
}
