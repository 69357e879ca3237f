//! Load config from file and environment.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use murmur_core::ProtocolConfig;
use rand::Rng;
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/murmur/config.toml or /etc/murmur/config.toml.
/// Env overrides: MURMUR_GROUP, MURMUR_PORT, MURMUR_PEER_ID, MURMUR_NAME.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Multicast group every node joins (default 239.255.0.0).
    #[serde(default = "default_group")]
    pub group: Ipv4Addr,
    /// UDP port bound and addressed on the group (default 45800).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Local peer id; drawn at random when unset. Zero is reserved.
    #[serde(default)]
    pub peer_id: Option<u16>,
    /// Display name carried in pulses.
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_level")]
    pub level: u8,
    /// Heartbeat period (default 2000 ms).
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    /// Tracing filter used when RUST_LOG is unset (default "info").
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Where received files are written.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    #[serde(default)]
    pub protocol: ProtocolConfig,
}

fn default_group() -> Ipv4Addr {
    Ipv4Addr::new(239, 255, 0, 0)
}
fn default_port() -> u16 {
    45800
}
fn default_name() -> String {
    std::env::var("USER").unwrap_or_else(|_| "anonymous".to_string())
}
fn default_level() -> u8 {
    1
}
fn default_heartbeat_ms() -> u64 {
    2000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_download_dir() -> PathBuf {
    PathBuf::from("murmur-downloads")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            group: default_group(),
            port: default_port(),
            peer_id: None,
            name: default_name(),
            level: default_level(),
            heartbeat_ms: default_heartbeat_ms(),
            log_level: default_log_level(),
            download_dir: default_download_dir(),
            protocol: ProtocolConfig::default(),
        }
    }
}

impl Config {
    /// Configured id, or a random non-zero one.
    pub fn resolve_peer_id(&self) -> u16 {
        match self.peer_id {
            Some(id) if id != 0 => id,
            _ => rand::thread_rng().gen_range(1..=u16::MAX),
        }
    }

    /// Apply environment overrides; `var` looks a variable up. Unparsable values are ignored.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(g) = var("MURMUR_GROUP").and_then(|s| s.parse().ok()) {
            self.group = g;
        }
        if let Some(p) = var("MURMUR_PORT").and_then(|s| s.parse().ok()) {
            self.port = p;
        }
        if let Some(id) = var("MURMUR_PEER_ID").and_then(|s| s.parse().ok()) {
            self.peer_id = Some(id);
        }
        if let Some(name) = var("MURMUR_NAME").filter(|s| !s.is_empty()) {
            self.name = name;
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> anyhow::Result<Config> {
    let mut c = match config_paths().into_iter().find(|p| p.exists()) {
        Some(path) => load_file(&path)?,
        None => Config::default(),
    };
    c.apply_env(|k| std::env::var(k).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/murmur/config.toml"));
    }
    out.push(PathBuf::from("/etc/murmur/config.toml"));
    out
}

fn load_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing {}", path.display()))
}
