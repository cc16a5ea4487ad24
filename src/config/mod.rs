use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tokio::fs;

use crate::proxy::forward::ForwardKind;
use crate::proxy::router::DEFAULT_SLOT_COUNT;
use crate::topology::SlotRecord;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    clusters: Vec<ClusterConfig>,
    /// Address of the Prometheus exposition endpoint, if any.
    #[serde(default)]
    pub metrics_addr: Option<String>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let cfg: Config = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        cfg.ensure_valid()?;
        Ok(cfg)
    }

    pub fn ensure_valid(&self) -> Result<()> {
        if self.clusters.is_empty() {
            bail!("configuration must declare at least one cluster");
        }
        let mut names = HashSet::new();
        for cluster in &self.clusters {
            cluster.ensure_valid()?;
            if !names.insert(cluster.name.to_lowercase()) {
                bail!("duplicate cluster name detected: {}", cluster.name);
            }
        }
        Ok(())
    }

    pub fn clusters(&self) -> &[ClusterConfig] {
        &self.clusters
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    pub listen_addr: String,

    /// Two-character pair delimiting the routed portion of a key.
    #[serde(default)]
    pub hash_tag: Option<String>,

    #[serde(default = "default_slot_count")]
    pub slot_count: usize,

    #[serde(default)]
    pub forward: ForwardKind,

    /// Logical databases exposed per backend (`SELECT` range).
    #[serde(default = "default_databases")]
    pub databases: u32,

    /// Parallel physical connections per (backend, database).
    #[serde(default = "default_backend_parallel")]
    pub backend_parallel: usize,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Initial slot table; replaced at runtime through the topology store.
    #[serde(default)]
    pub slots: Vec<SlotRecord>,
}

impl ClusterConfig {
    pub fn ensure_valid(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("cluster name cannot be empty");
        }
        if self.listen_addr.trim().is_empty() {
            bail!("cluster {} listen_addr cannot be empty", self.name);
        }
        parse_port(&self.listen_addr).with_context(|| {
            format!(
                "cluster {} listen_addr {} is not a valid address",
                self.name, self.listen_addr
            )
        })?;

        if let Some(tag) = &self.hash_tag {
            if tag.len() != 2 {
                bail!(
                    "cluster {} hash_tag must be exactly two characters",
                    self.name
                );
            }
        }
        if self.slot_count == 0 {
            bail!("cluster {} slot_count must be positive", self.name);
        }
        if self.databases == 0 {
            bail!("cluster {} databases must be positive", self.name);
        }
        if self.backend_parallel == 0 {
            bail!("cluster {} backend_parallel must be positive", self.name);
        }

        for record in &self.slots {
            if record.id >= self.slot_count {
                bail!(
                    "cluster {} slot record {} exceeds slot_count {}",
                    self.name,
                    record.id,
                    self.slot_count
                );
            }
            for addr in record_addrs(record) {
                parse_port(addr).with_context(|| {
                    format!(
                        "cluster {} slot {} references invalid address {}",
                        self.name, record.id, addr
                    )
                })?;
            }
        }
        Ok(())
    }

    pub fn hash_tag_bytes(&self) -> Vec<u8> {
        self.hash_tag
            .as_ref()
            .map(|tag| tag.as_bytes().to_vec())
            .unwrap_or_else(|| b"{}".to_vec())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }
}

fn record_addrs(record: &SlotRecord) -> impl Iterator<Item = &str> {
    let backend = Some(record.backend_addr.as_str())
        .into_iter()
        .filter(|addr| !addr.is_empty());
    backend
        .chain(record.migrate_addr.as_deref())
        .chain(record.replica_groups.iter().flatten().map(String::as_str))
}

fn parse_port(addr: &str) -> Result<u16> {
    if let Ok(socket) = addr.parse::<std::net::SocketAddr>() {
        return Ok(socket.port());
    }
    if let Some((host, port)) = addr.rsplit_once(':') {
        if host.is_empty() {
            bail!("missing host in address {}", addr);
        }
        return port
            .trim()
            .parse::<u16>()
            .with_context(|| format!("invalid port component {}", port));
    }
    bail!("unable to extract port from address {}", addr)
}

fn default_slot_count() -> usize {
    DEFAULT_SLOT_COUNT
}

fn default_databases() -> u32 {
    16
}

fn default_backend_parallel() -> usize {
    2
}

fn default_connect_timeout_ms() -> u64 {
    1_000
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Result<Config> {
        let cfg: Config = toml::from_str(raw)?;
        cfg.ensure_valid()?;
        Ok(cfg)
    }

    #[test]
    fn minimal_cluster_gets_defaults() {
        let cfg = parse(
            r#"
            [[clusters]]
            name = "main"
            listen_addr = "0.0.0.0:6379"
            "#,
        )
        .unwrap();
        let cluster = &cfg.clusters()[0];
        assert_eq!(cluster.slot_count, DEFAULT_SLOT_COUNT);
        assert_eq!(cluster.databases, 16);
        assert_eq!(cluster.forward, ForwardKind::Sync);
        assert_eq!(cluster.hash_tag_bytes(), b"{}");
    }

    #[test]
    fn parses_slot_records_and_forward_kind() {
        let cfg = parse(
            r#"
            [[clusters]]
            name = "main"
            listen_addr = "0.0.0.0:6379"
            forward = "semi_async"
            slot_count = 16

            [[clusters.slots]]
            id = 3
            backend_addr = "10.0.0.1:6380"
            migrate_addr = "10.0.0.2:6380"
            replica_groups = [["10.0.0.3:6380"]]
            action = { state = "migrating" }
            "#,
        )
        .unwrap();
        let cluster = &cfg.clusters()[0];
        assert_eq!(cluster.forward, ForwardKind::SemiAsync);
        assert_eq!(cluster.slots.len(), 1);
        assert_eq!(cluster.slots[0].action.state, "migrating");
    }

    #[test]
    fn rejects_bad_configs() {
        assert!(parse("").is_err());
        assert!(parse(
            r#"
            [[clusters]]
            name = ""
            listen_addr = "0.0.0.0:6379"
            "#
        )
        .is_err());
        assert!(parse(
            r#"
            [[clusters]]
            name = "main"
            listen_addr = "nowhere"
            "#
        )
        .is_err());
        assert!(parse(
            r#"
            [[clusters]]
            name = "main"
            listen_addr = "0.0.0.0:6379"
            slot_count = 4

            [[clusters.slots]]
            id = 9
            backend_addr = "10.0.0.1:6380"
            "#
        )
        .is_err());
        assert!(parse(
            r#"
            [[clusters]]
            name = "a"
            listen_addr = "0.0.0.0:6379"

            [[clusters]]
            name = "A"
            listen_addr = "0.0.0.0:6380"
            "#
        )
        .is_err());
    }
}
