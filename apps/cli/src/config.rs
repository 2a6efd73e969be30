use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use client_core::ClientConfig;

pub const DEFAULT_CONFIG_FILE: &str = "mdconv.toml";

/// Flags given on the command line; they win over file and environment.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub server_url: Option<String>,
    pub ws_url: Option<String>,
    pub request_timeout_secs: Option<u64>,
}

/// Defaults, then `mdconv.toml` (or the file passed with `--config`), then
/// environment, then command-line flags.
pub fn load_settings(config_path: Option<&Path>, overrides: &Overrides) -> anyhow::Result<ClientConfig> {
    let mut settings = match config_path {
        Some(path) => read_file(path)?,
        None => {
            let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if default_path.exists() {
                read_file(&default_path)?
            } else {
                ClientConfig::default()
            }
        }
    };

    apply_env(&mut settings, |key| std::env::var(key).ok());
    apply_overrides(&mut settings, overrides);
    Ok(settings)
}

fn read_file(path: &Path) -> anyhow::Result<ClientConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("invalid config file {}", path.display()))
}

pub fn apply_env(settings: &mut ClientConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("MDCONV_SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = var("APP__SERVER_URL") {
        settings.server_url = v;
    }

    if let Some(v) = var("MDCONV_WS_URL") {
        settings.ws_url = Some(v);
    }
    if let Some(v) = var("APP__WS_URL") {
        settings.ws_url = Some(v);
    }

    if let Some(v) = var("APP__REQUEST_TIMEOUT_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.request_timeout_secs = Some(parsed);
        }
    }
}

fn apply_overrides(settings: &mut ClientConfig, overrides: &Overrides) {
    if let Some(v) = &overrides.server_url {
        settings.server_url = v.clone();
    }
    if let Some(v) = &overrides.ws_url {
        settings.ws_url = Some(v.clone());
    }
    if let Some(v) = overrides.request_timeout_secs {
        settings.request_timeout_secs = Some(v);
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
