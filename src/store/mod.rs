//! Per-user settings and authorizations, persisted as one JSON file.
//!
//! All reads and writes go through a single async mutex; every mutation is
//! written back to disk before the lock is released.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::config::OpenRouterConfig;
use crate::logging::LogLevel;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSettings {
    #[serde(default)]
    pub openrouter_token: String,
    /// Name of the selected entry in `models`, empty when none is selected.
    #[serde(default)]
    pub current_model: String,
    /// Display name to OpenRouter model id.
    #[serde(default)]
    pub models: BTreeMap<String, String>,
}

impl UserSettings {
    /// OpenRouter id of the selected model.
    pub fn current_model_id(&self) -> Option<&str> {
        self.models
            .get(&self.current_model)
            .map(String::as_str)
            .filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreData {
    #[serde(default)]
    users: HashMap<i64, UserSettings>,
    #[serde(default)]
    authorized_ids: HashMap<i64, bool>,
    #[serde(default)]
    log_level: LogLevel,
}

/// Counts shown by `orbot status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSummary {
    pub users: usize,
    pub authorized: usize,
    pub log_level: LogLevel,
}

pub struct SettingsStore {
    path: PathBuf,
    defaults: UserSettings,
    data: Mutex<StoreData>,
}

impl SettingsStore {
    /// Load the store from `path`, starting empty if the file does not exist.
    pub fn open(path: impl Into<PathBuf>, openrouter: &OpenRouterConfig) -> Result<Self> {
        let path = path.into();
        let data = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings file {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse settings file {}", path.display()))?
        } else {
            tracing::info!(component = "store", path = %path.display(), "No settings file, starting empty");
            StoreData::default()
        };

        Ok(Self {
            path,
            defaults: UserSettings {
                openrouter_token: String::new(),
                current_model: openrouter.default_model.clone(),
                models: openrouter.default_models.clone(),
            },
            data: Mutex::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn is_authorized(&self, user_id: i64) -> bool {
        let data = self.data.lock().await;
        data.authorized_ids.get(&user_id).copied().unwrap_or(false)
    }

    pub async fn authorize(&self, user_id: i64) -> Result<()> {
        let mut data = self.data.lock().await;
        data.authorized_ids.insert(user_id, true);
        self.persist(&data)
    }

    /// Settings for `user_id`, creating them from the defaults on first use.
    pub async fn user(&self, user_id: i64) -> Result<UserSettings> {
        let mut data = self.data.lock().await;
        if let Some(settings) = data.users.get(&user_id) {
            return Ok(settings.clone());
        }
        tracing::info!(component = "store", user_id = user_id, "Creating default settings for new user");
        let settings = self.defaults.clone();
        data.users.insert(user_id, settings.clone());
        self.persist(&data)?;
        Ok(settings)
    }

    /// Read-modify-write of one user's settings under the store lock.
    pub async fn update_user<R>(
        &self,
        user_id: i64,
        f: impl FnOnce(&mut UserSettings) -> R,
    ) -> Result<R> {
        let mut data = self.data.lock().await;
        let settings = data
            .users
            .entry(user_id)
            .or_insert_with(|| self.defaults.clone());
        let result = f(settings);
        self.persist(&data)?;
        Ok(result)
    }

    pub async fn log_level(&self) -> LogLevel {
        self.data.lock().await.log_level
    }

    /// Flip between debug and info, returning the new level.
    pub async fn toggle_debug(&self) -> Result<LogLevel> {
        let mut data = self.data.lock().await;
        data.log_level = data.log_level.toggled();
        self.persist(&data)?;
        Ok(data.log_level)
    }

    pub async fn summary(&self) -> StoreSummary {
        let data = self.data.lock().await;
        StoreSummary {
            users: data.users.len(),
            authorized: data.authorized_ids.values().filter(|v| **v).count(),
            log_level: data.log_level,
        }
    }

    /// Write through a temporary file so a crash never leaves a torn file.
    fn persist(&self, data: &StoreData) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create settings directory")?;
        }
        let content = serde_json::to_string_pretty(data)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content).context("Failed to write settings file")?;
        std::fs::rename(&tmp, &self.path).context("Failed to replace settings file")?;
        tracing::debug!(component = "store", path = %self.path.display(), "Settings saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &tempfile::TempDir) -> SettingsStore {
        SettingsStore::open(dir.path().join("bot_config.json"), &OpenRouterConfig::default())
            .unwrap()
    }

    #[tokio::test]
    async fn test_new_user_gets_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);

        let user = store.user(42).await.unwrap();
        assert_eq!(user.current_model, "gpt-3.5-turbo");
        assert_eq!(user.current_model_id(), Some("openai/gpt-3.5-turbo"));
        assert_eq!(user.models.len(), 6);
        assert!(user.openrouter_token.is_empty());
    }

    #[tokio::test]
    async fn test_settings_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open(&dir);
            store.authorize(7).await.unwrap();
            store
                .update_user(7, |u| {
                    u.openrouter_token = "sk-or-123".into();
                    u.models.insert("fast".into(), "openai/gpt-4o-mini".into());
                    u.current_model = "fast".into();
                })
                .await
                .unwrap();
            assert_eq!(store.toggle_debug().await.unwrap(), LogLevel::Debug);
        }

        let store = open(&dir);
        assert!(store.is_authorized(7).await);
        assert!(!store.is_authorized(8).await);
        let user = store.user(7).await.unwrap();
        assert_eq!(user.openrouter_token, "sk-or-123");
        assert_eq!(user.current_model_id(), Some("openai/gpt-4o-mini"));
        assert_eq!(store.log_level().await, LogLevel::Debug);
        assert_eq!(
            store.summary().await,
            StoreSummary {
                users: 1,
                authorized: 1,
                log_level: LogLevel::Debug
            }
        );
    }

    #[tokio::test]
    async fn test_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        store.authorize(5).await.unwrap();
        store
            .update_user(5, |u| *u = UserSettings::default())
            .await
            .unwrap();

        let raw = std::fs::read_to_string(store.path()).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["authorized_ids"]["5"], serde_json::json!(true));
        assert_eq!(json["users"]["5"]["current_model"], serde_json::json!(""));
        assert_eq!(json["log_level"], serde_json::json!("info"));
        assert!(!dir.path().join("bot_config.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bot_config.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = SettingsStore::open(&path, &OpenRouterConfig::default())
            .err()
            .unwrap();
        assert!(err.to_string().contains("Failed to parse settings file"));
    }

    #[test]
    fn test_current_model_id_requires_known_model() {
        let mut user = UserSettings::default();
        assert_eq!(user.current_model_id(), None);
        user.current_model = "gone".into();
        assert_eq!(user.current_model_id(), None);
    }
}
