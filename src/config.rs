use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use url::Url;

use crate::paths;

#[derive(Debug, Default, Deserialize, Clone)]
struct PartialConfig {
    #[serde(default)]
    app_key: Option<String>,
    #[serde(default)]
    app_secret: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    local_folder: Option<PathBuf>,
    #[serde(default)]
    dropbox_folder: Option<String>,
    #[serde(default)]
    interval_seconds: Option<u64>,
    #[serde(default)]
    debug: Option<bool>,
    #[serde(default)]
    api_url: Option<String>,
    #[serde(default)]
    content_url: Option<String>,
    #[serde(default)]
    call_timeout_seconds: Option<u64>,
    #[serde(default)]
    log_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub app_key: String,
    pub app_secret: String,
    pub refresh_token: String,
    /// Local sync root; created on first pass if absent.
    pub local_folder: PathBuf,
    /// Remote namespace root; empty string means the user's root.
    pub dropbox_folder: String,
    pub interval_seconds: u64,
    /// When set, upward operations are logged but not executed.
    pub debug: bool,
    pub api_url: String,
    pub content_url: String,
    pub call_timeout_seconds: u64,
    pub log_file: Option<PathBuf>,
    pub config_path: Option<PathBuf>,
}

/// CLI flags take precedence over env vars, which take precedence over the
/// config file.
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub local_folder: Option<PathBuf>,
    pub dropbox_folder: Option<String>,
    pub interval_seconds: Option<u64>,
    pub debug: Option<bool>,
}

impl Config {
    pub fn default_api_url() -> &'static str {
        "https://api.dropboxapi.com"
    }

    pub fn default_content_url() -> &'static str {
        "https://content.dropboxapi.com"
    }

    pub fn default_config_path() -> PathBuf {
        home_dir().join(".dropsync").join("config.json")
    }

    pub fn resolve_config_path(flag_path: Option<&Path>) -> PathBuf {
        if let Some(p) = flag_path {
            return absolutize_path(p);
        }
        if let Ok(env_path) = std::env::var("DROPSYNC_CONFIG_PATH") {
            let env_path = env_path.trim();
            if !env_path.is_empty() {
                return absolutize_path(Path::new(env_path));
            }
        }
        absolutize_path(&Self::default_config_path())
    }

    pub fn load_with_overrides(path: &Path, overrides: ConfigOverrides) -> Result<Self> {
        let file_cfg = if path.exists() {
            let data = std::fs::read_to_string(path)
                .with_context(|| format!("read config {}", path.display()))?;
            serde_json::from_str::<PartialConfig>(&data).context("parse config json")?
        } else {
            PartialConfig::default()
        };

        let env_cfg = read_env_config();

        let app_key = env_cfg.app_key.or(file_cfg.app_key).unwrap_or_default();
        let app_secret = env_cfg
            .app_secret
            .or(file_cfg.app_secret)
            .unwrap_or_default();
        let refresh_token = env_cfg
            .refresh_token
            .or(file_cfg.refresh_token)
            .unwrap_or_default();
        let local_folder = overrides
            .local_folder
            .or(env_cfg.local_folder)
            .or(file_cfg.local_folder)
            .unwrap_or_else(|| home_dir().join("Dropsync"));
        let dropbox_folder = overrides
            .dropbox_folder
            .or(env_cfg.dropbox_folder)
            .or(file_cfg.dropbox_folder)
            .unwrap_or_default();
        let interval_seconds = overrides
            .interval_seconds
            .or(env_cfg.interval_seconds)
            .or(file_cfg.interval_seconds)
            .unwrap_or(30);
        let debug = overrides
            .debug
            .or(env_cfg.debug)
            .or(file_cfg.debug)
            .unwrap_or(false);
        let api_url = env_cfg
            .api_url
            .or(file_cfg.api_url)
            .unwrap_or_else(|| Self::default_api_url().to_string());
        let content_url = env_cfg
            .content_url
            .or(file_cfg.content_url)
            .unwrap_or_else(|| Self::default_content_url().to_string());
        let call_timeout_seconds = env_cfg
            .call_timeout_seconds
            .or(file_cfg.call_timeout_seconds)
            .unwrap_or(60);
        let log_file = env_cfg.log_file.or(file_cfg.log_file);

        let mut cfg = Config {
            app_key,
            app_secret,
            refresh_token,
            local_folder,
            dropbox_folder,
            interval_seconds,
            debug,
            api_url,
            content_url,
            call_timeout_seconds,
            log_file,
            config_path: Some(absolutize_path(path)),
        };
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    fn normalize(&mut self) {
        self.local_folder = absolutize_path(&self.local_folder);
        self.dropbox_folder = paths::normalize_remote_root(&self.dropbox_folder);
        self.api_url = self.api_url.trim_end_matches('/').to_string();
        self.content_url = self.content_url.trim_end_matches('/').to_string();
    }

    fn validate(&self) -> Result<()> {
        if self.interval_seconds < 1 {
            anyhow::bail!("interval_seconds must be at least 1");
        }
        validate_url(&self.api_url).context("api_url")?;
        validate_url(&self.content_url).context("content_url")?;
        if self.local_folder.as_os_str().is_empty() {
            anyhow::bail!("local_folder is empty");
        }
        Ok(())
    }

    pub fn log_file_path(&self) -> PathBuf {
        if let Some(p) = &self.log_file {
            return p.clone();
        }
        home_dir().join(".dropsync").join("logs").join("dropsync.log")
    }
}

pub(crate) fn validate_url(raw: &str) -> Result<()> {
    let url = Url::parse(raw)?;
    if url.scheme() != "http" && url.scheme() != "https" {
        anyhow::bail!("url must be http or https");
    }
    Ok(())
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn absolutize_path(path: &Path) -> PathBuf {
    let expanded = expand_tilde(path);
    if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(expanded)
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    let mut components = path.components();
    match components.next() {
        Some(Component::Normal(c)) if c == OsStr::new("~") => {
            let mut out = home_dir();
            for c in components {
                out.push(c.as_os_str());
            }
            out
        }
        _ => path.to_path_buf(),
    }
}

fn read_env_config() -> PartialConfig {
    let mut out = PartialConfig::default();
    if let Some(v) = env_string("DROPSYNC_APP_KEY") {
        out.app_key = Some(v);
    }
    if let Some(v) = env_string("DROPSYNC_APP_SECRET") {
        out.app_secret = Some(v);
    }
    if let Some(v) = env_string("DROPSYNC_REFRESH_TOKEN") {
        out.refresh_token = Some(v);
    }
    if let Some(v) = env_string("DROPSYNC_LOCAL_FOLDER") {
        out.local_folder = Some(PathBuf::from(v));
    }
    if let Some(v) = env_string("DROPSYNC_DROPBOX_FOLDER") {
        out.dropbox_folder = Some(v);
    }
    if let Some(v) = env_string("DROPSYNC_INTERVAL_SECONDS") {
        out.interval_seconds = v.parse().ok();
    }
    if let Some(v) = env_string("DROPSYNC_DEBUG") {
        out.debug = Some(v != "0" && v.to_lowercase() != "false");
    }
    if let Some(v) = env_string("DROPSYNC_API_URL") {
        out.api_url = Some(v);
    }
    if let Some(v) = env_string("DROPSYNC_CONTENT_URL") {
        out.content_url = Some(v);
    }
    out
}

fn env_string(key: &str) -> Option<String> {
    let v = std::env::var(key).ok()?;
    let v = v.trim();
    if v.is_empty() {
        None
    } else {
        Some(v.to_string())
    }
}
