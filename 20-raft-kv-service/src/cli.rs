use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::discovery::DEFAULT_SERVICE_NAME;
use crate::discovery::multicast::DiscoveryConfig;
use crate::service::ServiceConfig;
use crate::store::StoreConfig;

#[derive(Parser, Debug)]
#[command(author, version, about = "Replicated key-value store over Raft", long_about = None)]
pub struct Cli {
    /// Keep the Raft log in memory instead of journaling it under --path.
    #[arg(long)]
    pub inmem: bool,

    /// Form a single-node cluster if the log is empty.
    #[arg(long)]
    pub bootstrap: bool,

    /// HTTP bind address.
    #[arg(long, default_value = "127.0.0.1:11000")]
    pub haddr: String,

    /// Raft bind address, also advertised to peers.
    #[arg(long, default_value = "127.0.0.1:12000")]
    pub raddr: String,

    /// HTTP address of an existing member to join at startup.
    #[arg(long)]
    pub join: Option<String>,

    /// Node ID. Defaults to the Raft bind address.
    #[arg(long)]
    pub id: Option<String>,

    /// Directory for Raft storage.
    #[arg(long)]
    pub path: PathBuf,

    /// Do not advertise or browse for peers.
    #[arg(long)]
    pub no_discovery: bool,

    /// Discovery service name.
    #[arg(long, default_value = DEFAULT_SERVICE_NAME)]
    pub service: String,

    /// Wait between failed join attempts of a discovered peer.
    #[arg(long, default_value_t = 5000)]
    pub join_backoff_ms: u64,

    /// Applied entries between log compactions.
    #[arg(long, default_value_t = 1024)]
    pub snapshot_threshold: u64,

    /// How long a write waits for replication.
    #[arg(long, default_value_t = 10_000)]
    pub apply_timeout_ms: u64,
}

impl Cli {
    pub fn node_id(&self) -> String {
        self.id.clone().unwrap_or_else(|| self.raddr.clone())
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            in_memory: self.inmem,
            apply_timeout: Duration::from_millis(self.apply_timeout_ms),
            snapshot_threshold: self.snapshot_threshold,
            ..StoreConfig::new(&self.path, &self.raddr)
        }
    }

    pub fn service_config(&self) -> ServiceConfig {
        let discovery = (!self.no_discovery).then(|| DiscoveryConfig {
            service: self.service.clone(),
            ..DiscoveryConfig::new(self.node_id())
        });
        ServiceConfig {
            join_backoff: Duration::from_millis(self.join_backoff_ms),
            discovery,
            ..ServiceConfig::new(self.node_id(), &self.haddr, &self.raddr)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cli = Cli::try_parse_from(["raft-kv-service", "--path", "/tmp/node"]).unwrap();
        assert!(!cli.inmem && !cli.bootstrap);
        assert_eq!(cli.node_id(), "127.0.0.1:12000");

        let store = cli.store_config();
        assert_eq!(store.raft_dir, PathBuf::from("/tmp/node"));
        assert_eq!(store.apply_timeout, Duration::from_secs(10));
        assert_eq!(store.snapshot_threshold, 1024);

        let service = cli.service_config();
        assert_eq!(service.http_addr, "127.0.0.1:11000");
        assert_eq!(service.join_backoff, Duration::from_secs(5));
        let discovery = service.discovery.unwrap();
        assert_eq!(discovery.service, DEFAULT_SERVICE_NAME);
        assert_eq!(discovery.instance, "127.0.0.1:12000");
    }

    #[test]
    fn path_is_required() {
        assert!(Cli::try_parse_from(["raft-kv-service", "--bootstrap"]).is_err());
    }

    #[test]
    fn explicit_flags() {
        let cli = Cli::try_parse_from([
            "raft-kv-service",
            "--inmem",
            "--id",
            "node-b",
            "--raddr",
            "10.0.0.2:12000",
            "--join",
            "10.0.0.1:11000",
            "--no-discovery",
            "--path",
            "data",
        ])
        .unwrap();
        assert_eq!(cli.node_id(), "node-b");
        assert_eq!(cli.join.as_deref(), Some("10.0.0.1:11000"));
        assert!(cli.store_config().in_memory);
        assert!(cli.service_config().discovery.is_none());
    }
}
