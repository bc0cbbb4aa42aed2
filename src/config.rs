#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_MEDIA_ROOT: &str = "./data";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_SITE_NAME: &str = "VideyLite";
pub const DEFAULT_MAX_UPLOAD_MB: u64 = 400;

/// Blob directory relative to the media root.
pub const VIDEOS_SUBDIR: &str = "videos";
/// Catalog database file relative to the media root.
pub const CATALOG_DB_FILE: &str = "catalog.db";

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub media_root: PathBuf,
    pub host: String,
    pub port: u16,
    pub base_url: String,
    pub site_name: String,
    pub trust_proxy: bool,
    pub view_salt: String,
    /// Largest file `videoctl add` accepts, in MiB.
    pub max_upload_mb: u64,
}

impl RuntimeSettings {
    pub fn videos_dir(&self) -> PathBuf {
        self.media_root.join(VIDEOS_SUBDIR)
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.media_root.join(CATALOG_DB_FILE)
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub media_root: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub base_url: Option<String>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_settings(overrides: RuntimeOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    Ok(build_runtime_settings(&file_vars, env_var_string, overrides))
}

fn build_runtime_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> RuntimeSettings {
    let media_root = overrides
        .media_root
        .or_else(|| lookup_value("MEDIA_ROOT", file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_MEDIA_ROOT));
    let port = overrides
        .port
        .or_else(|| {
            lookup_value("VIDEYLITE_PORT", file_vars, &env_lookup)
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_PORT);
    let host = non_blank(overrides.host)
        .or_else(|| lookup_value("VIDEYLITE_HOST", file_vars, &env_lookup))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let base_url = non_blank(overrides.base_url)
        .or_else(|| lookup_value("BASE_URL", file_vars, &env_lookup))
        .map(|value| value.trim_end_matches('/').to_string())
        .unwrap_or_else(|| format!("http://{host}:{port}"));
    let site_name = lookup_value("SITE_NAME", file_vars, &env_lookup)
        .unwrap_or_else(|| DEFAULT_SITE_NAME.to_string());
    let trust_proxy = lookup_value("TRUST_PROXY", file_vars, &env_lookup)
        .map(|value| parse_flag(&value))
        .unwrap_or(false);
    let view_salt = lookup_value("VIEW_SALT", file_vars, &env_lookup).unwrap_or_default();
    let max_upload_mb = lookup_value("MAX_UPLOAD_MB", file_vars, &env_lookup)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_MAX_UPLOAD_MB);

    RuntimeSettings {
        media_root,
        host,
        port,
        base_url,
        site_name,
        trust_proxy,
        view_salt,
        max_upload_mb,
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .filter(|value| !value.trim().is_empty())
}

/// Parses a `KEY=value` file. Blank lines, comments and lines without `=` are
/// skipped; a leading `export ` and matching quotes are stripped.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
