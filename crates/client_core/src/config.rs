use std::{collections::HashMap, fs, path::Path, time::Duration};

use anyhow::Context;

use crate::error::ClientError;

pub const DEFAULT_CONFIG_PATH: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub server_url: String,
    pub typing_idle: Duration,
    pub dedup_window: Duration,
    pub reconnect_initial_backoff: Duration,
    pub reconnect_max_backoff: Duration,
    pub reconnect_max_attempts: Option<u32>,
    pub event_buffer: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            typing_idle: Duration::from_millis(1200),
            dedup_window: Duration::from_millis(2000),
            reconnect_initial_backoff: Duration::from_millis(500),
            reconnect_max_backoff: Duration::from_secs(10),
            reconnect_max_attempts: None,
            event_buffer: 256,
        }
    }
}

/// Loads `client.toml` from the working directory, then applies environment
/// overrides.
pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(DEFAULT_CONFIG_PATH))
}

pub fn load_settings_from(path: &Path) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<HashMap<String, String>>(&raw) {
            Ok(file_cfg) => apply_overrides(&mut settings, |key| file_cfg.get(key).cloned()),
            Err(err) => tracing::warn!(path = %path.display(), "config: ignoring unreadable file: {err}"),
        }
    }

    if let Ok(v) = std::env::var("CHAT_SERVER_URL") {
        settings.server_url = v;
    }
    apply_overrides(&mut settings, |key| {
        std::env::var(format!("APP__{}", key.to_ascii_uppercase())).ok()
    });

    settings
}

fn apply_overrides(settings: &mut ClientSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("server_url") {
        settings.server_url = v;
    }
    if let Some(ms) = lookup("typing_idle_ms").and_then(|v| parse_millis(&v)) {
        settings.typing_idle = ms;
    }
    if let Some(ms) = lookup("dedup_window_ms").and_then(|v| parse_millis(&v)) {
        settings.dedup_window = ms;
    }
    if let Some(ms) = lookup("reconnect_initial_ms").and_then(|v| parse_millis(&v)) {
        settings.reconnect_initial_backoff = ms;
    }
    if let Some(ms) = lookup("reconnect_max_ms").and_then(|v| parse_millis(&v)) {
        settings.reconnect_max_backoff = ms;
    }
    if let Some(v) = lookup("reconnect_max_attempts") {
        if let Ok(parsed) = v.trim().parse::<u32>() {
            settings.reconnect_max_attempts = Some(parsed);
        }
    }
    if let Some(v) = lookup("event_buffer") {
        if let Ok(parsed) = v.trim().parse::<usize>() {
            settings.event_buffer = parsed.max(1);
        }
    }
}

fn parse_millis(raw: &str) -> Option<Duration> {
    raw.trim().parse::<u64>().ok().map(Duration::from_millis)
}

/// Rewrites an `http(s)://` service url into the websocket endpoint for one
/// user.
pub fn websocket_url(server_url: &str, user_id: &str) -> anyhow::Result<url::Url> {
    let server_url = server_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = server_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(ClientError::InvalidServerUrl(server_url.to_string()).into());
    };

    let mut url = url::Url::parse(&format!("{ws_base}/ws"))
        .with_context(|| format!("invalid server url: {server_url}"))?;
    url.query_pairs_mut().append_pair("user_id", user_id);
    Ok(url)
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
