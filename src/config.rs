use anyhow::{Context, Result, anyhow, bail};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{info, warn};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/reeltube-env";
pub const DEFAULT_DATABASE_PATH: &str = "/var/lib/reeltube/reeltube.db";
pub const DEFAULT_UPLOAD_DIR: &str = "/var/lib/reeltube/uploads";
pub const DEFAULT_REELTUBE_HOST: &str = "127.0.0.1";
pub const DEFAULT_REELTUBE_PORT: u16 = 8080;
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 24 * 60 * 60;
pub const DEFAULT_MAX_UPLOAD_MB: usize = 100;

const MIN_SECRET_LEN: usize = 32;

/// Raw values from the env file and the process environment. Every field is
/// optional; defaults are applied by [`Settings::resolve`].
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub database_path: Option<PathBuf>,
    pub upload_dir: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub token_secret: Option<String>,
    pub token_ttl_secs: Option<i64>,
    pub max_upload_mb: Option<usize>,
}

impl EnvConfig {
    /// Applies one `KEY=value` pair. Unknown keys are ignored and empty values
    /// leave the current setting untouched.
    fn apply(&mut self, key: &str, value: &str, origin: &str) -> Result<()> {
        if value.is_empty() {
            return Ok(());
        }
        match key {
            "DATABASE_PATH" => self.database_path = Some(PathBuf::from(value)),
            "UPLOAD_DIR" => self.upload_dir = Some(PathBuf::from(value)),
            "REELTUBE_HOST" => self.host = Some(value.to_string()),
            "REELTUBE_PORT" => {
                let port = value
                    .parse()
                    .with_context(|| format!("Parsing REELTUBE_PORT from {origin}"))?;
                self.port = Some(port);
            }
            "TOKEN_SECRET" => self.token_secret = Some(value.to_string()),
            "TOKEN_TTL_SECS" => {
                let ttl: i64 = value
                    .parse()
                    .with_context(|| format!("Parsing TOKEN_TTL_SECS from {origin}"))?;
                if ttl <= 0 {
                    bail!("TOKEN_TTL_SECS must be positive in {origin}");
                }
                self.token_ttl_secs = Some(ttl);
            }
            "MAX_UPLOAD_MB" => {
                let mb = value
                    .parse()
                    .with_context(|| format!("Parsing MAX_UPLOAD_MB from {origin}"))?;
                self.max_upload_mb = Some(mb);
            }
            _ => {}
        }
        Ok(())
    }
}

pub fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let origin = path.display().to_string();
    let mut cfg = EnvConfig::default();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some((key, value_raw)) = trimmed.split_once('=') {
            let value = value_raw.trim().trim_matches('"');
            cfg.apply(key.trim(), value, &origin)?;
        }
    }
    Ok(Some(cfg))
}

/// Fully resolved runtime settings for the backend.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_path: PathBuf,
    pub upload_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub token_secret: String,
    pub token_ttl: chrono::Duration,
    pub max_upload_bytes: usize,
}

impl Settings {
    /// Reads the env file at `path` (if present) and lets the process
    /// environment override it.
    pub fn load(path: &Path) -> Result<Self> {
        let file = read_env_config(path)?;
        if file.is_none() {
            info!(path = %path.display(), "config file not found, using environment only");
        }
        Self::resolve(file, |key| std::env::var(key).ok())
    }

    /// Merges file values with environment lookups. The token secret has no
    /// fallback: startup fails when it is missing.
    pub fn resolve<F>(file: Option<EnvConfig>, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = file.unwrap_or_default();
        for key in [
            "DATABASE_PATH",
            "UPLOAD_DIR",
            "REELTUBE_HOST",
            "REELTUBE_PORT",
            "TOKEN_SECRET",
            "TOKEN_TTL_SECS",
            "MAX_UPLOAD_MB",
        ] {
            if let Some(value) = env(key) {
                cfg.apply(key, value.trim(), "environment")?;
            }
        }

        let token_secret = cfg
            .token_secret
            .ok_or_else(|| anyhow!("TOKEN_SECRET must be set in the config file or environment"))?;
        if token_secret.len() < MIN_SECRET_LEN {
            warn!("TOKEN_SECRET is shorter than {MIN_SECRET_LEN} bytes");
        }

        let max_upload_mb = cfg.max_upload_mb.unwrap_or(DEFAULT_MAX_UPLOAD_MB);
        let max_upload_bytes = max_upload_mb
            .checked_mul(1024 * 1024)
            .ok_or_else(|| anyhow!("MAX_UPLOAD_MB={max_upload_mb} is too large"))?;

        Ok(Self {
            database_path: cfg
                .database_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE_PATH)),
            upload_dir: cfg
                .upload_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_UPLOAD_DIR)),
            host: cfg
                .host
                .unwrap_or_else(|| DEFAULT_REELTUBE_HOST.to_string()),
            port: cfg.port.unwrap_or(DEFAULT_REELTUBE_PORT),
            token_secret,
            token_ttl: chrono::Duration::seconds(
                cfg.token_ttl_secs.unwrap_or(DEFAULT_TOKEN_TTL_SECS),
            ),
            max_upload_bytes,
        })
    }
}
