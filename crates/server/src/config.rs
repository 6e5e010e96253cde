use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use device_link::{default_port_identifiers, LinkConfig, DEFAULT_BAUD_RATE};
use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    /// Empty means discover the controller by identifier.
    pub serial_port: String,
    pub baud_rate: u32,
    pub reconnect_backoff_ms: u64,
    pub keepalive_interval_ms: u64,
    pub log_pings: bool,
    pub port_identifiers: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8080".into(),
            database_url: "sqlite://./data/recipes.db".into(),
            serial_port: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            reconnect_backoff_ms: 3_000,
            keepalive_interval_ms: 5_000,
            log_pings: false,
            port_identifiers: default_port_identifiers(),
        }
    }
}

impl Settings {
    pub fn link_config(&self) -> LinkConfig {
        let serial_port = self.serial_port.trim();
        LinkConfig {
            port_path: (!serial_port.is_empty()).then(|| serial_port.to_string()),
            baud_rate: self.baud_rate,
            reconnect_backoff: Duration::from_millis(self.reconnect_backoff_ms.max(1)),
            keepalive_interval: Duration::from_millis(self.keepalive_interval_ms.max(1)),
            log_pings: self.log_pings,
            port_identifiers: self.port_identifiers.clone(),
        }
    }
}

/// Defaults, then `server.toml`, then `APP__*` environment variables.
pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("server.toml") {
        apply_file_overrides(&mut settings, &raw);
    }
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());

    settings
}

pub(crate) fn apply_file_overrides(settings: &mut Settings, raw: &str) {
    let file_cfg = match toml::from_str::<HashMap<String, toml::Value>>(raw) {
        Ok(file_cfg) => file_cfg,
        Err(err) => {
            warn!(%err, "config: server.toml is not valid, ignoring it");
            return;
        }
    };

    for (key, value) in file_cfg {
        apply_setting(settings, &key, &value_to_string(&value));
    }
}

pub(crate) fn apply_env_overrides(
    settings: &mut Settings,
    lookup: impl Fn(&str) -> Option<String>,
) {
    if let Some(v) = lookup("DATABASE_URL") {
        settings.database_url = v;
    }
    for key in [
        "bind_addr",
        "database_url",
        "serial_port",
        "baud_rate",
        "reconnect_backoff_ms",
        "keepalive_interval_ms",
        "log_pings",
        "port_identifiers",
    ] {
        if let Some(v) = lookup(&format!("APP__{}", key.to_uppercase())) {
            apply_setting(settings, key, &v);
        }
    }
}

fn apply_setting(settings: &mut Settings, key: &str, value: &str) {
    match key {
        "bind_addr" => settings.server_bind = value.to_string(),
        "database_url" => settings.database_url = value.to_string(),
        "serial_port" => settings.serial_port = value.trim().to_string(),
        "baud_rate" => parse_into(key, value, &mut settings.baud_rate),
        "reconnect_backoff_ms" => parse_into(key, value, &mut settings.reconnect_backoff_ms),
        "keepalive_interval_ms" => parse_into(key, value, &mut settings.keepalive_interval_ms),
        "log_pings" => parse_into(key, value, &mut settings.log_pings),
        "port_identifiers" => settings.port_identifiers = split_identifiers(value),
        other => warn!(key = other, "config: unknown setting ignored"),
    }
}

fn parse_into<T: std::str::FromStr>(key: &str, value: &str, target: &mut T) {
    match value.trim().parse() {
        Ok(parsed) => *target = parsed,
        Err(_) => warn!(key, value, "config: unparsable value ignored"),
    }
}

fn split_identifiers(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn value_to_string(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        toml::Value::Array(items) => items
            .iter()
            .map(value_to_string)
            .collect::<Vec<_>>()
            .join(","),
        other => other.to_string(),
    }
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite:{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
