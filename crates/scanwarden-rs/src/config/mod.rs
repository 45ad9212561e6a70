use std::{env, fs, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::{executor::ExecutorConfig, stream::TailOptions};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub scans_dir: PathBuf,
    pub nuclei_bin: String,
    pub httpx_bin: String,
    pub batch_concurrency: usize,
    pub spawn_retries: u32,
    /// 0 disables the timeout.
    pub scan_timeout_secs: u64,
    pub tick_secs: u64,
    pub stream_poll_ms: u64,
    pub scope_allowlist: Vec<String>,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = env::var("SCANWARDEN_CONFIG").unwrap_or_else(|_| "config.json".to_string());
        let file_cfg: Option<AppConfig> = fs::read_to_string(&path)
            .ok()
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .with_context(|| format!("failed to parse {path}"))?;

        let mut cfg = file_cfg.unwrap_or_default();
        cfg.apply_env(|key| env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        fn parsed<T: FromStr>(key: &str, raw: String) -> anyhow::Result<T>
        where
            T::Err: std::fmt::Display,
        {
            raw.trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid {key}={raw}: {e}"))
        }

        if let Some(v) = var("SW_HOST") {
            self.host = v;
        }
        if let Some(v) = var("SW_PORT") {
            self.port = parsed("SW_PORT", v)?;
        }
        if let Some(v) = var("SW_DATABASE_URL") {
            self.database_url = v;
        }
        if let Some(v) = var("SW_SCANS_DIR") {
            self.scans_dir = PathBuf::from(v);
        }
        if let Some(v) = var("SW_NUCLEI_BIN") {
            self.nuclei_bin = v;
        }
        if let Some(v) = var("SW_HTTPX_BIN") {
            self.httpx_bin = v;
        }
        if let Some(v) = var("SW_BATCH_CONCURRENCY") {
            self.batch_concurrency = parsed("SW_BATCH_CONCURRENCY", v)?;
        }
        if let Some(v) = var("SW_SPAWN_RETRIES") {
            self.spawn_retries = parsed("SW_SPAWN_RETRIES", v)?;
        }
        if let Some(v) = var("SW_SCAN_TIMEOUT_SECS") {
            self.scan_timeout_secs = parsed("SW_SCAN_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = var("SW_TICK_SECS") {
            self.tick_secs = parsed("SW_TICK_SECS", v)?;
        }
        if let Some(v) = var("SW_STREAM_POLL_MS") {
            self.stream_poll_ms = parsed("SW_STREAM_POLL_MS", v)?;
        }
        if let Some(v) = var("SW_SCOPE_ALLOWLIST") {
            self.scope_allowlist = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_concurrency == 0 {
            bail!("batch_concurrency must be at least 1");
        }
        if self.tick_secs == 0 {
            bail!("tick_secs must be at least 1");
        }
        if self.stream_poll_ms == 0 {
            bail!("stream_poll_ms must be at least 1");
        }
        if self.nuclei_bin.trim().is_empty() || self.httpx_bin.trim().is_empty() {
            bail!("tool binaries must be configured");
        }
        Ok(())
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            scans_dir: self.scans_dir.clone(),
            nuclei_bin: self.nuclei_bin.clone(),
            httpx_bin: self.httpx_bin.clone(),
            batch_concurrency: self.batch_concurrency,
            spawn_retries: self.spawn_retries,
            scan_timeout: (self.scan_timeout_secs > 0).then(|| Duration::from_secs(self.scan_timeout_secs)),
            scope_allowlist: self.scope_allowlist.clone(),
        }
    }

    pub fn tail_options(&self) -> TailOptions {
        TailOptions {
            poll_interval: Duration::from_millis(self.stream_poll_ms),
            ..TailOptions::default()
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    /// Binaries the process runner may launch.
    pub fn allowed_binaries(&self) -> Vec<String> {
        vec![self.nuclei_bin.clone(), self.httpx_bin.clone()]
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            database_url: "sqlite://scanwarden.db".to_string(),
            scans_dir: PathBuf::from("scans"),
            nuclei_bin: "nuclei".to_string(),
            httpx_bin: "httpx".to_string(),
            batch_concurrency: 1,
            spawn_retries: 0,
            scan_timeout_secs: 0,
            tick_secs: 60,
            stream_poll_ms: 500,
            scope_allowlist: vec![],
        }
    }
}
