use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::{AppConfig, LineConfig};

pub const LINE_CHANNEL_SECRET: &str = "line_channel_secret";
pub const LINE_CHANNEL_ACCESS_TOKEN: &str = "line_channel_access_token";
pub const GATEWAY_AUTH_TOKEN: &str = "gateway_auth_token";

/// Secrets store. Keeps channel secrets and tokens out of the main config.
/// File is written with restrictive permissions (0o600 on Unix).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecretsStore {
    secrets: HashMap<String, String>,
}

impl SecretsStore {
    /// Load secrets from file, or create empty if not found.
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let store: SecretsStore = serde_json::from_str(&data)?;
            info!("Loaded {} secrets from {}", store.secrets.len(), path.display());
            Ok(store)
        } else {
            Ok(Self::default())
        }
    }

    /// Save secrets to file with restrictive permissions.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let data = serde_json::to_string_pretty(&self)?;
        std::fs::write(path, &data)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(path, perms)?;
        }

        info!("Saved {} secrets to {} (0o600)", self.secrets.len(), path.display());
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.secrets.get(key).map(|s| s.as_str())
    }

    pub fn set(&mut self, key: String, value: String) {
        self.secrets.insert(key, value);
    }

    /// Fill config values that are unset with values from this store.
    /// Values already present in the config win.
    pub fn apply_to(&self, config: &mut AppConfig) {
        let line = config.line.get_or_insert(LineConfig {
            channel_secret: None,
            channel_access_token: None,
            api_base: None,
        });
        if line.channel_secret.as_deref().unwrap_or_default().is_empty() {
            line.channel_secret = self.get(LINE_CHANNEL_SECRET).map(str::to_string);
        }
        if line.channel_access_token.is_none() {
            line.channel_access_token = self.get(LINE_CHANNEL_ACCESS_TOKEN).map(str::to_string);
        }
        if config.server.auth_token.is_none() {
            config.server.auth_token = self.get(GATEWAY_AUTH_TOKEN).map(str::to_string);
        }
    }

    pub fn default_path() -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".castline/secrets.json")
    }
}

/// Mask a secret value for safe display in logs.
/// Shows first 4 and last 4 chars, the rest as `****`.
pub fn mask_secret(value: &str) -> String {
    if value.len() <= 8 || !value.is_ascii() {
        "****".to_string()
    } else {
        format!("{}****{}", &value[..4], &value[value.len() - 4..])
    }
}
