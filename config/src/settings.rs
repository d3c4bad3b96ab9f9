//! Application settings management

use crate::{PathManager, crypto};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8000/api";
pub const DEFAULT_PROVIDER: &str = "openrouter";
pub const DEFAULT_HISTORY_LIMIT: usize = 12;
pub const DEFAULT_RETENTION_LIMIT: usize = 60;

/// Application settings stored in settings.toml
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Settings {
    /// Base URL of the storefront API (e.g., "https://shop.example.com/api")
    pub backend_url: Option<String>,
    /// Model provider the backend should route the conversation to
    pub provider: Option<String>,
    /// Sealed provider credential, see [`crypto::seal`]
    pub api_key: Option<String>,
    /// Number of prior turns sent along with each message, at most 12
    pub history_limit: Option<usize>,
    /// Number of messages kept in the persisted snapshot
    pub retention_limit: Option<usize>,
    /// Suffix separating snapshots of different profiles on one machine
    pub storage_scope: Option<String>,
}

impl Settings {
    /// Load settings from the settings file, or return defaults if not found
    pub fn load() -> Self {
        match PathManager::settings_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = fs::read_to_string(path) else {
            return Self::default();
        };
        toml::from_str(&content).unwrap_or_default()
    }

    /// Save settings to the settings file
    pub fn save(&self) -> Result<(), String> {
        let path = PathManager::settings_path().ok_or("Could not determine settings path")?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config dir: {}", e))?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize settings: {}", e))?;
        fs::write(path, content).map_err(|e| format!("Failed to write settings: {}", e))?;
        Ok(())
    }

    /// Get the decrypted credential. Returns None if not set or unreadable on this machine.
    pub fn get_api_key(&self) -> Option<String> {
        self.api_key
            .as_deref()
            .and_then(|sealed| crypto::open(sealed).ok())
    }

    pub fn set_api_key(&mut self, api_key: &str) -> Result<(), String> {
        self.api_key = Some(crypto::seal(api_key)?);
        Ok(())
    }

    pub fn remove_api_key(&mut self) {
        self.api_key = None;
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }
}

/// Settings after applying environment overrides and defaults.
///
/// Environment wins over the settings file:
/// `STOREFRONT_API_URL`, `STOREFRONT_PROVIDER`, `STOREFRONT_API_KEY`.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub backend_url: String,
    pub provider: String,
    pub api_key: Option<String>,
    pub history_limit: usize,
    pub retention_limit: usize,
    pub storage_scope: Option<String>,
}

impl ClientSettings {
    pub fn from_env(settings: &Settings) -> Self {
        Self::resolve(settings, |key| std::env::var(key).ok())
    }

    pub fn resolve(settings: &Settings, env: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        let backend_url = non_empty("STOREFRONT_API_URL")
            .or_else(|| settings.backend_url.clone())
            .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string());

        Self {
            backend_url: backend_url.trim_end_matches('/').to_string(),
            provider: non_empty("STOREFRONT_PROVIDER")
                .or_else(|| settings.provider.clone())
                .unwrap_or_else(|| DEFAULT_PROVIDER.to_string()),
            api_key: non_empty("STOREFRONT_API_KEY").or_else(|| settings.get_api_key()),
            history_limit: settings
                .history_limit
                .map_or(DEFAULT_HISTORY_LIMIT, |limit| limit.min(DEFAULT_HISTORY_LIMIT)),
            retention_limit: settings.retention_limit.unwrap_or(DEFAULT_RETENTION_LIMIT),
            storage_scope: settings.storage_scope.clone(),
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self::resolve(&Settings::default(), |_| None)
    }
}
