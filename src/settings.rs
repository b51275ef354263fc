use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::PathBuf,
    sync::{PoisonError, RwLock},
    time::Duration,
};

/// Timing and paging knobs for the render engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// How long a freshly submitted key (and its record) stays locked.
    pub lock_duration_ms: u64,
    /// Poll cadence while any render is queued.
    pub poll_interval_ms: u64,
    /// Each tick that still finds a queued render pushes the deadline out by this much.
    pub poll_extend_ms: u64,
    /// Hard stop measured from the supervisor's first start.
    pub poll_ceiling_ms: u64,
    pub feed_page_size: usize,
    pub cooldown_tick_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_duration_ms: 60_000,
            poll_interval_ms: 5_000,
            poll_extend_ms: 5 * 60_000,
            poll_ceiling_ms: 10 * 60_000,
            feed_page_size: 100,
            cooldown_tick_ms: 250,
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn poll_extend(&self) -> Duration {
        Duration::from_millis(self.poll_extend_ms)
    }

    pub fn poll_ceiling(&self) -> Duration {
        Duration::from_millis(self.poll_ceiling_ms)
    }

    pub fn cooldown_tick(&self) -> Duration {
        Duration::from_millis(self.cooldown_tick_ms.max(1))
    }

    /// Apply `RENDERDESK_*` environment overrides on top of the loaded values.
    pub fn apply_env_overrides(mut self) -> Self {
        let debug_mode = std::env::var("RENDERDESK_DEBUG")
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if debug_mode {
            self.poll_interval_ms = 1_000;
        }

        if let Some(ms) = env_millis("RENDERDESK_POLL_INTERVAL_MS") {
            self.poll_interval_ms = ms;
        }
        if let Some(ms) = env_millis("RENDERDESK_LOCK_DURATION_MS") {
            self.lock_duration_ms = ms;
        }
        self
    }
}

fn env_millis(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(value) => Some(value),
        Err(err) => {
            log::warn!("Ignoring {name}={raw:?}: {err}");
            None
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct UserSettings {
    engine: EngineConfig,
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<UserSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                log::warn!("Malformed settings at {}, using defaults: {err}", path.display());
                UserSettings::default()
            })
        } else {
            UserSettings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn engine(&self) -> EngineConfig {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .engine
            .clone()
    }

    pub fn update_engine(&self, config: EngineConfig) -> Result<()> {
        let mut guard = self.data.write().unwrap_or_else(PoisonError::into_inner);
        guard.engine = config;
        self.persist(&guard)
    }

    fn persist(&self, data: &UserSettings) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("renderdesk-{name}-{}.json", uuid::Uuid::new_v4()))
    }

    #[test]
    fn missing_file_yields_defaults() {
        let store = SettingsStore::new(scratch_path("missing")).unwrap();
        assert_eq!(store.engine(), EngineConfig::default());
    }

    #[test]
    fn update_persists_and_reloads() {
        let path = scratch_path("roundtrip");
        let store = SettingsStore::new(path.clone()).unwrap();
        let config = EngineConfig {
            poll_interval_ms: 2_000,
            ..EngineConfig::default()
        };
        store.update_engine(config.clone()).unwrap();

        let reloaded = SettingsStore::new(path.clone()).unwrap();
        assert_eq!(reloaded.engine(), config);
        let _ = fs::remove_file(path);
    }

    #[test]
    fn partial_settings_fill_in_defaults() {
        let path = scratch_path("partial");
        fs::write(&path, r#"{"engine": {"lockDurationMs": 1000}}"#).unwrap();
        let store = SettingsStore::new(path.clone()).unwrap();
        let engine = store.engine();
        assert_eq!(engine.lock_duration_ms, 1000);
        assert_eq!(engine.poll_interval_ms, 5_000);
        let _ = fs::remove_file(path);
    }

    #[test]
    fn malformed_settings_fall_back() {
        let path = scratch_path("malformed");
        fs::write(&path, "{ not json").unwrap();
        let store = SettingsStore::new(path.clone()).unwrap();
        assert_eq!(store.engine(), EngineConfig::default());
        let _ = fs::remove_file(path);
    }
}
