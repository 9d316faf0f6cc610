use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use url::Url;

use crate::transfer::TransferTuning;

pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:3000";
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:3000";
pub const DEFAULT_OWNER_GRACE_SECS: u64 = 45;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_out_dir")]
    pub out_dir: PathBuf,
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    #[serde(default = "default_owner_grace_secs")]
    pub owner_grace_secs: u64,
    #[serde(default)]
    pub direct: DirectConfig,
    #[serde(default)]
    pub tuning: TuningOverrides,
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DirectConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Host advertised in the host candidate. Falls back to the outbound
    /// interface address when unset.
    #[serde(default)]
    pub advertise_host: Option<String>,
    /// `host:port` of a STUN server used for the server-reflexive candidate.
    #[serde(default)]
    pub stun_server: Option<String>,
}

impl Default for DirectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_addr: default_bind_addr(),
            advertise_host: None,
            stun_server: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TuningOverrides {
    #[serde(default)]
    pub chunk_size: Option<usize>,
    #[serde(default)]
    pub probe_bytes: Option<usize>,
    #[serde(default)]
    pub throughput_threshold_bytes_per_sec: Option<f64>,
    #[serde(default)]
    pub high_water_bytes: Option<u64>,
    #[serde(default)]
    pub low_water_bytes: Option<u64>,
    #[serde(default)]
    pub negotiation_timeout_secs: Option<u64>,
    #[serde(default)]
    pub probe_timeout_secs: Option<u64>,
    #[serde(default)]
    pub jitter_grace_secs: Option<u64>,
    #[serde(default)]
    pub relay_ping_every: Option<u64>,
    #[serde(default)]
    pub relay_window: Option<u64>,
}

impl TuningOverrides {
    pub fn apply(&self, base: TransferTuning) -> TransferTuning {
        let mut t = base;
        if let Some(v) = self.chunk_size {
            t.chunk_size = v;
        }
        if let Some(v) = self.probe_bytes {
            t.probe_bytes = v;
        }
        if let Some(v) = self.throughput_threshold_bytes_per_sec {
            t.throughput_threshold = v;
        }
        if let Some(v) = self.high_water_bytes {
            t.high_water = v;
        }
        if let Some(v) = self.low_water_bytes {
            t.low_water = v;
        }
        if let Some(v) = self.negotiation_timeout_secs {
            t.negotiation_timeout = Duration::from_secs(v);
        }
        if let Some(v) = self.probe_timeout_secs {
            t.probe_timeout = Duration::from_secs(v);
        }
        if let Some(v) = self.jitter_grace_secs {
            t.jitter_grace = Duration::from_secs(v);
        }
        if let Some(v) = self.relay_ping_every {
            t.relay_ping_every = v;
        }
        if let Some(v) = self.relay_window {
            // Must cover at least one ack interval.
            t.relay_window = v.max(crate::transfer::RELAY_ACK_EVERY);
        }
        t
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            listen_addr: default_listen_addr(),
            out_dir: default_out_dir(),
            log_path: None,
            owner_grace_secs: DEFAULT_OWNER_GRACE_SECS,
            direct: DirectConfig::default(),
            tuning: TuningOverrides::default(),
            config_path: None,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let mut cfg: Config = serde_json::from_str(&data).context("parse config json")?;
        cfg.config_path = Some(path.to_path_buf());
        cfg.normalize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => {
                let mut cfg = Self::default();
                cfg.normalize()?;
                cfg.validate()?;
                Ok(cfg)
            }
        }
    }

    /// Re-checks the config after CLI flags were applied on top of the file.
    pub fn finish_overrides(&mut self) -> Result<()> {
        self.normalize()?;
        self.validate()
    }

    pub fn tuning(&self) -> TransferTuning {
        self.tuning.apply(TransferTuning::default())
    }

    pub fn owner_grace(&self) -> Duration {
        Duration::from_secs(self.owner_grace_secs)
    }

    pub fn log_file_path(&self) -> PathBuf {
        if let Some(p) = &self.log_path {
            return p.clone();
        }
        if let Some(dir) = self.config_path.as_ref().and_then(|p| p.parent()) {
            return dir.join("logs").join("dropshare.log");
        }
        default_log_file_path()
    }

    fn normalize(&mut self) -> Result<()> {
        self.server_url = self.server_url.trim().trim_end_matches('/').to_string();
        self.listen_addr = self.listen_addr.trim().to_string();
        if self.out_dir.is_relative() {
            if let Ok(abs) = std::fs::canonicalize(&self.out_dir) {
                self.out_dir = abs;
            }
        }
        if let Some(host) = &self.direct.advertise_host {
            if host.trim().is_empty() {
                self.direct.advertise_host = None;
            }
        }
        if let Some(stun) = &self.direct.stun_server {
            if stun.trim().is_empty() {
                self.direct.stun_server = None;
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        validate_url(&self.server_url).context("server_url")?;
        self.listen_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("listen_addr {}", self.listen_addr))?;
        self.direct
            .bind_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("direct.bind_addr {}", self.direct.bind_addr))?;
        if let Some(stun) = &self.direct.stun_server {
            if !stun.contains(':') {
                anyhow::bail!("direct.stun_server must be host:port, got {stun}");
            }
        }
        if self.owner_grace_secs == 0 {
            anyhow::bail!("owner_grace_secs must be positive");
        }
        let tuning = self.tuning();
        if tuning.chunk_size == 0 || tuning.probe_bytes == 0 {
            anyhow::bail!("tuning: chunk_size and probe_bytes must be positive");
        }
        if tuning.low_water >= tuning.high_water {
            anyhow::bail!(
                "tuning: low_water ({}) must be below high_water ({})",
                tuning.low_water,
                tuning.high_water
            );
        }
        Ok(())
    }
}

pub fn default_log_file_path() -> PathBuf {
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    home.join(".dropshare").join("logs").join("dropshare.log")
}

/// Websocket endpoint for a server base url.
pub fn ws_url(server_url: &str) -> Result<Url> {
    let mut url = Url::parse(server_url).with_context(|| format!("parse {server_url}"))?;
    let scheme = match url.scheme() {
        "https" => "wss",
        _ => "ws",
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow::anyhow!("cannot derive websocket url from {server_url}"))?;
    url.set_path("/ws");
    Ok(url)
}

pub fn share_link(server_url: &str, session_id: &str) -> String {
    format!("{}/s/{}", server_url.trim_end_matches('/'), session_id)
}

pub fn validate_session_id(id: &str) -> Result<()> {
    static PATTERN: once_cell::sync::Lazy<Regex> =
        once_cell::sync::Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{6}$").unwrap());
    if PATTERN.is_match(id) {
        Ok(())
    } else {
        anyhow::bail!("invalid session id: {id}")
    }
}

/// Accepts either a bare session id or a share link ending in `/s/<id>`.
pub fn parse_session_ref(input: &str) -> Result<String> {
    let input = input.trim();
    let id = match Url::parse(input) {
        Ok(url) => {
            let mut segments = url
                .path_segments()
                .map(|s| s.filter(|p| !p.is_empty()).collect::<Vec<_>>())
                .unwrap_or_default();
            match (segments.pop(), segments.pop()) {
                (Some(id), Some("s")) => id.to_string(),
                _ => anyhow::bail!("not a share link: {input}"),
            }
        }
        Err(_) => input.to_string(),
    };
    validate_session_id(&id)?;
    Ok(id)
}

fn validate_url(raw: &str) -> Result<()> {
    let url = Url::parse(raw)?;
    if url.scheme() != "http" && url.scheme() != "https" {
        anyhow::bail!("url must be http or https");
    }
    Ok(())
}

fn default_server_url() -> String {
    DEFAULT_SERVER_URL.to_string()
}

fn default_listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.to_string()
}

fn default_out_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_owner_grace_secs() -> u64 {
    DEFAULT_OWNER_GRACE_SECS
}

fn default_bind_addr() -> String {
    "0.0.0.0:0".to_string()
}

fn default_true() -> bool {
    true
}
