use std::path::{Path, PathBuf};

use async_trait::async_trait;
use calpull_core::Settings;
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;
use uuid::Uuid;

pub const SETTINGS_FILE: &str = "settings.yaml";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing settings: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    InvalidTimezone(#[from] calpull_core::InvalidTimezone),
}

/// Host configuration storage: feed URL, timezone, schedule.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn load(&self) -> Result<Settings, SettingsError>;
    async fn save(&self, settings: &Settings) -> Result<(), SettingsError>;
}

fn validate(settings: &Settings) -> Result<(), SettingsError> {
    settings.parse_timezone()?;
    Ok(())
}

/// `settings.yaml` on disk, optionally overridden by `CALPULL_*` environment variables.
#[derive(Debug, Clone)]
pub struct YamlSettingsStore {
    path: PathBuf,
    env_overrides: bool,
}

impl YamlSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            env_overrides: false,
        }
    }

    pub fn from_workspace_root(root: &Path) -> Self {
        Self::new(root.join(SETTINGS_FILE)).with_env_overrides(true)
    }

    pub fn with_env_overrides(mut self, enabled: bool) -> Self {
        self.env_overrides = enabled;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, action: &'static str, source: std::io::Error) -> SettingsError {
        SettingsError::Io {
            action,
            path: self.path.display().to_string(),
            source,
        }
    }
}

fn apply_env_overrides(settings: &mut Settings) {
    if let Ok(url) = std::env::var("CALPULL_FEED_URL") {
        settings.feed_url = url;
    }
    if let Ok(tz) = std::env::var("CALPULL_TIMEZONE") {
        settings.timezone = tz;
    }
    if let Ok(cron) = std::env::var("CALPULL_SCHEDULE") {
        settings.schedule = cron;
    }
}

#[async_trait]
impl SettingsStore for YamlSettingsStore {
    async fn load(&self) -> Result<Settings, SettingsError> {
        let mut settings = match fs::read_to_string(&self.path).await {
            Ok(text) => serde_yaml::from_str(&text)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Settings::default(),
            Err(err) => return Err(self.io_error("reading", err)),
        };
        if self.env_overrides {
            apply_env_overrides(&mut settings);
        }
        Ok(settings)
    }

    async fn save(&self, settings: &Settings) -> Result<(), SettingsError> {
        validate(settings)?;
        let text = serde_yaml::to_string(settings)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error("creating directory for", e))?;
        }

        // Write-then-rename so a concurrent load never sees a half-written file.
        let temp_path = self.path.with_extension(format!("{}.tmp", Uuid::new_v4()));
        fs::write(&temp_path, text)
            .await
            .map_err(|e| self.io_error("writing", e))?;
        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(self.io_error("replacing", err));
        }
        Ok(())
    }
}

/// Settings held in memory; for embedding and tests.
#[derive(Debug, Default)]
pub struct InMemorySettings {
    inner: RwLock<Settings>,
}

impl InMemorySettings {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: RwLock::new(settings),
        }
    }
}

#[async_trait]
impl SettingsStore for InMemorySettings {
    async fn load(&self) -> Result<Settings, SettingsError> {
        Ok(self.inner.read().await.clone())
    }

    async fn save(&self, settings: &Settings) -> Result<(), SettingsError> {
        validate(settings)?;
        *self.inner.write().await = settings.clone();
        Ok(())
    }
}
