//! Hub configuration: `config.json` plus `.env`.
//!
//! Layout follows the setup wizard's file (`server`, `paths`, `integrations`),
//! with `gateway` and `telemetry` sections added. A missing file yields defaults.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::ProviderDescriptor;

/** \brief Default config file name, relative to the working directory. */
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub server: ServerSection,
    pub paths: PathsSection,
    /** \brief Flat key/value map: `<provider>_key`, `<provider>_model`, `<provider>_base`, ... */
    pub integrations: BTreeMap<String, String>,
    pub gateway: GatewaySection,
    pub telemetry: TelemetrySection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5050,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    pub db_path: PathBuf,
    pub ui_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("monky.db"),
            ui_dir: PathBuf::from("dist"),
            log_dir: PathBuf::from("logs"),
        }
    }
}

/**
 * \brief Adapter timeouts, in seconds.
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub ping_timeout_secs: u64,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            request_timeout_secs: 60,
            ping_timeout_secs: 20,
        }
    }
}

impl GatewaySection {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySection {
    /** \brief Also write logs to a daily file under `paths.log_dir`. */
    pub enabled: bool,
}

impl HubConfig {
    /**
     * \brief Reads `path`; a missing file gives the defaults.
     */
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse config {}", path.display()))
    }

    /**
     * \brief Loads `path`, then `.env`, then fills blank credentials and path
     * overrides from the process environment.
     */
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        if let Ok(found) = dotenvy::dotenv() {
            debug!(path = %found.display(), "loaded .env");
        }
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    /**
     * \brief Overlays environment values using `lookup` (injected for tests).
     */
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for provider in crate::registry::all() {
            let Some(key) = provider.credential_key else {
                continue;
            };
            if self.value(key).is_some() {
                continue;
            }
            if let Some(secret) = provider
                .credential_env
                .iter()
                .filter_map(|name| lookup(name))
                .find(|v| !v.trim().is_empty())
            {
                self.integrations.insert(key.to_string(), secret);
            }
        }
        if let Some(db) = lookup("MONKY_DB").filter(|v| !v.trim().is_empty()) {
            self.paths.db_path = PathBuf::from(db);
        }
        if let Some(ui) = lookup("MONKY_UI_DIR").filter(|v| !v.trim().is_empty()) {
            self.paths.ui_dir = PathBuf::from(ui);
        }
    }

    /** \brief Non-blank integration value. */
    pub fn value(&self, key: &str) -> Option<&str> {
        self.integrations
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.integrations.insert(key.into(), value.into());
        self
    }

    /**
     * \brief Credential for `provider`: `Ok(None)` when none is required,
     * `Err(key)` when one is required and missing.
     */
    pub fn credential(&self, provider: &ProviderDescriptor) -> std::result::Result<Option<String>, String> {
        match provider.credential_key {
            None => Ok(None),
            Some(key) => self
                .value(key)
                .map(|v| Some(v.to_string()))
                .ok_or_else(|| key.to_string()),
        }
    }

    /** \brief Request override, then configured selection, then descriptor default. */
    pub fn model_for(&self, provider: &ProviderDescriptor, requested: Option<&str>) -> String {
        requested
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .or_else(|| provider.model_selection_key.and_then(|k| self.value(k)))
            .unwrap_or(provider.default_model)
            .to_string()
    }

    pub fn base_url_for(&self, provider: &ProviderDescriptor) -> String {
        provider
            .base_url_key
            .and_then(|k| self.value(k))
            .unwrap_or(provider.default_base_url)
            .trim_end_matches('/')
            .to_string()
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::describe;
    use std::io::Write;

    #[test]
    fn test_missing_file_gives_defaults() {
        let cfg = HubConfig::from_file("/definitely/not/here/config.json").expect("defaults");
        assert_eq!(cfg.server.port, 5050);
        assert_eq!(cfg.gateway.request_timeout_secs, 60);
        assert!(cfg.integrations.is_empty());
    }

    #[test]
    fn test_reads_wizard_layout() {
        let mut file = tempfile::NamedTempFile::new().expect("tmp");
        write!(
            file,
            r#"{{
                "server": {{"host": "0.0.0.0", "port": 8000}},
                "paths": {{"db_path": "data/hub.db"}},
                "integrations": {{"openai_key": "sk-abc", "openai_model": "gpt-4o-mini", "qwen_key": "  "}},
                "features": {{"work": true}}
            }}"#
        )
        .expect("write");
        let cfg = HubConfig::from_file(file.path()).expect("load");
        assert_eq!(cfg.listen_addr(), "0.0.0.0:8000");
        assert_eq!(cfg.paths.db_path, PathBuf::from("data/hub.db"));
        assert_eq!(cfg.paths.ui_dir, PathBuf::from("dist"));

        let openai = describe("openai").expect("openai");
        assert_eq!(cfg.credential(openai), Ok(Some("sk-abc".to_string())));
        assert_eq!(cfg.model_for(openai, None), "gpt-4o-mini");
        assert_eq!(cfg.model_for(openai, Some("o3")), "o3");

        let qwen = describe("qwen").expect("qwen");
        assert_eq!(cfg.credential(qwen), Err("qwen_key".to_string()));
        assert_eq!(cfg.model_for(qwen, Some("  ")), "qwen-plus");
    }

    #[test]
    fn test_env_fills_only_blank_credentials() {
        let mut cfg = HubConfig::default();
        cfg.set("openai_key", "from-file");
        cfg.apply_env(|name| match name {
            "OPENAI_API_KEY" => Some("from-env".to_string()),
            "DASHSCOPE_API_KEY" => Some("dash".to_string()),
            "MONKY_DB" => Some("/tmp/x.db".to_string()),
            _ => None,
        });
        assert_eq!(cfg.value("openai_key"), Some("from-file"));
        assert_eq!(cfg.value("qwen_key"), Some("dash"));
        assert_eq!(cfg.paths.db_path, PathBuf::from("/tmp/x.db"));
    }

    #[test]
    fn test_base_url_override_strips_trailing_slash() {
        let mut cfg = HubConfig::default();
        let ollama = describe("ollama").expect("ollama");
        assert_eq!(cfg.base_url_for(ollama), "http://localhost:11434");
        cfg.set("ollama_host", "http://10.0.0.5:11434/");
        assert_eq!(cfg.base_url_for(ollama), "http://10.0.0.5:11434");
        assert_eq!(cfg.credential(ollama), Ok(None));
    }
}
