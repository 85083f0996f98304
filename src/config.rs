// ⚙️ Configuration - TOML file with environment overrides

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_path: PathBuf,
    /// How long a store transaction waits for a competing writer
    pub busy_timeout_ms: u64,
    pub validation: ValidationConfig,
    pub mirror: MirrorConfig,
    pub server: ServerConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// When false any integer area is accepted
    pub enforce_area_range: bool,
    /// Inclusive bounds for `area`
    pub area_min: i64,
    pub area_max: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Base URL of the spreadsheet API. No URL means no mirror.
    pub url: Option<String>,
    pub timeout_secs: u64,
    /// Minimum time between two full snapshot pushes
    pub push_cooldown_secs: u64,
    /// Period of the background tick that flushes deferred pushes
    pub tick_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database_path: PathBuf::from("registrations.db"),
            busy_timeout_ms: 5_000,
            validation: ValidationConfig::default(),
            mirror: MirrorConfig::default(),
            server: ServerConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        ValidationConfig {
            enforce_area_range: true,
            area_min: 1,
            area_max: 7,
        }
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        MirrorConfig {
            url: None,
            timeout_secs: 10,
            push_cooldown_secs: 300,
            tick_interval_secs: 60,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: "0.0.0.0:3000".to_string(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            filter: "info".to_string(),
        }
    }
}

impl MirrorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn push_cooldown(&self) -> Duration {
        Duration::from_secs(self.push_cooldown_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        // interval() panics on a zero period
        Duration::from_secs(self.tick_interval_secs.max(1))
    }
}

impl Config {
    /// Read `path` if it exists (defaults otherwise), then apply `REGISTRY_*` overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            Self::from_toml(&raw)
                .with_context(|| format!("Failed to parse config {}", path.display()))?
        } else {
            Config::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let rendered = toml::to_string_pretty(self).context("Failed to render config")?;
        fs::write(path, rendered)
            .with_context(|| format!("Failed to write config {}", path.display()))?;
        Ok(())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(db) = lookup("REGISTRY_DATABASE") {
            self.database_path = PathBuf::from(db);
        }
        if let Some(url) = lookup("REGISTRY_MIRROR_URL") {
            self.mirror.url = Some(url).filter(|u| !u.trim().is_empty());
        }
        if let Some(bind) = lookup("REGISTRY_BIND") {
            self.server.bind = bind;
        }
        if let Some(cooldown) = lookup("REGISTRY_PUSH_COOLDOWN_SECS") {
            self.mirror.push_cooldown_secs = cooldown
                .trim()
                .parse()
                .context("REGISTRY_PUSH_COOLDOWN_SECS must be a whole number of seconds")?;
        }
        Ok(())
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}
