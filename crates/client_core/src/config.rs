use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use tracing::warn;

pub const SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub history_page_size: usize,
    /// Cap for the single bounded fetch used when a transport cannot page.
    pub fallback_history_limit: usize,
    pub event_queue_capacity: usize,
    pub stop_timeout_ms: u64,
    pub markers_database_url: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            history_page_size: 50,
            fallback_history_limit: 1000,
            event_queue_capacity: 256,
            stop_timeout_ms: 2000,
            markers_database_url: "sqlite://./data/markers.db".into(),
        }
    }
}

impl Settings {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    fn clamped(mut self) -> Self {
        self.history_page_size = self.history_page_size.clamp(1, 500);
        self.fallback_history_limit = self.fallback_history_limit.max(1);
        self.event_queue_capacity = self.event_queue_capacity.max(1);
        self.stop_timeout_ms = self.stop_timeout_ms.max(10);
        if self.markers_database_url.trim().is_empty() {
            self.markers_database_url = Settings::default().markers_database_url;
        }
        self
    }
}

pub fn load_settings() -> Settings {
    load_settings_from(Path::new(SETTINGS_FILE))
}

/// Reads `path` if it exists, then applies `APP__*` environment overrides.
pub fn load_settings_from(path: &Path) -> Settings {
    let mut settings = read_settings_file(path).unwrap_or_default();
    apply_overrides(&mut settings, |name| std::env::var(name).ok());
    settings.clamped()
}

fn read_settings_file(path: &Path) -> Option<Settings> {
    let raw = fs::read_to_string(path).ok()?;
    match toml::from_str::<Settings>(&raw) {
        Ok(settings) => Some(settings),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "config: ignoring unreadable settings file");
            None
        }
    }
}

fn apply_overrides<F>(settings: &mut Settings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    fn parsed<T: std::str::FromStr>(name: &str, value: Option<String>) -> Option<T> {
        let value = value?;
        match value.trim().parse() {
            Ok(parsed) => Some(parsed),
            Err(_) => {
                warn!(name, value = %value, "config: ignoring non-numeric override");
                None
            }
        }
    }

    if let Some(v) = parsed("APP__HISTORY_PAGE_SIZE", lookup("APP__HISTORY_PAGE_SIZE")) {
        settings.history_page_size = v;
    }
    if let Some(v) = parsed("APP__FALLBACK_HISTORY_LIMIT", lookup("APP__FALLBACK_HISTORY_LIMIT")) {
        settings.fallback_history_limit = v;
    }
    if let Some(v) = parsed("APP__EVENT_QUEUE_CAPACITY", lookup("APP__EVENT_QUEUE_CAPACITY")) {
        settings.event_queue_capacity = v;
    }
    if let Some(v) = parsed("APP__STOP_TIMEOUT_MS", lookup("APP__STOP_TIMEOUT_MS")) {
        settings.stop_timeout_ms = v;
    }
    if let Some(v) = lookup("APP__MARKERS_DATABASE_URL") {
        settings.markers_database_url = v;
    }
}

/// Turns a plain path or `sqlite:` URL into a `sqlite://` URL and creates
/// its parent directory.
pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    storage::ensure_sqlite_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().markers_database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:") || raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    let path = raw_database_url
        .strip_prefix("sqlite:")
        .unwrap_or(raw_database_url)
        .replace('\\', "/");
    format!("sqlite://{path}")
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
