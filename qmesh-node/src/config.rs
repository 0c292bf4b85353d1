//! Load config from file and environment.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use qmesh_core::{KernelConfig, StaticMembership};
use serde::Deserialize;

/// Daemon configuration. File: `$QMESH_CONFIG`, ~/.config/qmesh/config.toml or
/// /etc/qmesh/config.toml. Env overrides: QMESH_LISTEN, QMESH_MAX_QUERIES,
/// QMESH_FORWARD_TIMEOUT_MS, QMESH_WORKERS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address this node listens on and identifies itself by (default 127.0.0.1:36462).
    #[serde(default = "default_listen")]
    pub listen: SocketAddrV4,
    /// Peers pinged for liveness.
    #[serde(default)]
    pub peers: Vec<SocketAddrV4>,
    /// Seconds between liveness pings (default 30).
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// Partition id to the nodes replicating it.
    #[serde(default)]
    pub replicas: HashMap<String, Vec<SocketAddrV4>>,
    #[serde(default)]
    pub kernel: KernelConfig,
}

fn default_listen() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, 36462)
}
fn default_ping_interval_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            peers: Vec::new(),
            ping_interval_secs: default_ping_interval_secs(),
            replicas: HashMap::new(),
            kernel: KernelConfig::default(),
        }
    }
}

impl Config {
    /// Replica table keyed by numeric partition id.
    pub fn membership(&self) -> anyhow::Result<StaticMembership> {
        let mut m = StaticMembership::new();
        for (id, hosts) in &self.replicas {
            let id: i64 = id
                .trim()
                .parse()
                .with_context(|| format!("replicas: partition id {id:?} is not an integer"))?;
            m = m.with_replicas(id, hosts.clone());
        }
        Ok(m)
    }

    /// Partition ids, sorted.
    pub fn partitions(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .replicas
            .keys()
            .filter_map(|k| k.trim().parse().ok())
            .collect();
        ids.sort_unstable();
        ids
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> anyhow::Result<Config> {
    let mut c = match find_file() {
        Some(p) => from_file(&p)?,
        None => Config::default(),
    };
    apply_env(&mut c, |k| std::env::var(k).ok())?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    if let Some(p) = std::env::var_os("QMESH_CONFIG") {
        return vec![PathBuf::from(p)];
    }
    let mut out = Vec::new();
    if let Some(h) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(h.join(".config/qmesh/config.toml"));
    }
    out.push(PathBuf::from("/etc/qmesh/config.toml"));
    out
}

fn find_file() -> Option<PathBuf> {
    config_paths().into_iter().find(|p| p.exists())
}

pub fn from_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    parse(&s).with_context(|| format!("parsing {}", path.display()))
}

pub fn parse(s: &str) -> anyhow::Result<Config> {
    Ok(toml::from_str::<Config>(s)?)
}

/// Env overrides. Set-but-malformed values are errors rather than being ignored.
pub fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
    if let Some(s) = var("QMESH_LISTEN") {
        c.listen = s
            .parse()
            .with_context(|| format!("QMESH_LISTEN={s:?}"))?;
    }
    if let Some(s) = var("QMESH_MAX_QUERIES") {
        c.kernel.max_queries = s
            .parse()
            .with_context(|| format!("QMESH_MAX_QUERIES={s:?}"))?;
    }
    if let Some(s) = var("QMESH_FORWARD_TIMEOUT_MS") {
        c.kernel.forward_timeout_ms = s
            .parse()
            .with_context(|| format!("QMESH_FORWARD_TIMEOUT_MS={s:?}"))?;
    }
    if let Some(s) = var("QMESH_WORKERS") {
        let n: usize = s.parse().with_context(|| format!("QMESH_WORKERS={s:?}"))?;
        if n == 0 {
            bail!("QMESH_WORKERS must be at least 1");
        }
        c.kernel.workers = n;
    }
    Ok(())
}
