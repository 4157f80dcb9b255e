//! Node configuration and cluster-wide tunables.
//!
//! Everything a node needs is an explicit value on [`NodeConfig`]; the
//! environment-driven constructors exist for deployments, so tests can
//! build clusters without touching the process environment.

use ipnet::IpNet;
use slog::Drain;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming the subnet that is scanned for registries.
pub const ENV_SUBNET: &str = "DFTP_SUBNET";

/// Environment variable holding the cluster-wide replication factor K.
pub const ENV_REPLICATION_K: &str = "DATA_NODE_REPLICATION_K";

/// Port every node listens on for inter-node messages.
pub const DEFAULT_CONTROL_PORT: u16 = 9000;

/// Port routing nodes listen on for FTP control connections.
pub const DEFAULT_FTP_PORT: u16 = 21;

/// Default timeout for a plain inter-node request/response exchange.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// Timeout for credential checks; bcrypt verification is deliberately slow.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for a single discovery probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(800);

/// Upper bound on concurrent discovery probes.
pub const PROBE_WORKERS: usize = 32;

/// Interval between heartbeat/probe rounds on non-registry nodes.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

/// Interval between registry peer-discovery rounds.
pub const REGISTRY_DISCOVERY_INTERVAL: Duration = Duration::from_secs(10);

/// A membership entry is evicted when its heartbeat is older than this.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between eviction sweeps of the membership table.
pub const CLEAN_INTERVAL: Duration = Duration::from_secs(60);

/// Timeout for a pairwise `MERGE_STATE` exchange.
pub const MERGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for the `DATA_READY` handshake through the processing node.
pub const DATA_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for `PROCESS_FTP_COMMAND` and the data-channel verbs behind it.
/// Generous so that file transfers fit inside a single exchange.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

/// How long a PASV listener waits for the client before giving up.
pub const PASV_ACCEPT_TIMEOUT: Duration = Duration::from_secs(300);

/// Per-target replication retry budget.
pub const REPLICATE_ATTEMPTS: u32 = 3;

/// Base timeout for one replication attempt; grows by
/// [`REPLICATE_TIMEOUT_STEP`] on every retry.
pub const REPLICATE_BASE_TIMEOUT: Duration = Duration::from_secs(30);

/// Added to the replication timeout on each successive attempt.
pub const REPLICATE_TIMEOUT_STEP: Duration = Duration::from_secs(5);

/// Wall-clock cap on a whole replicated store operation.
pub const STORE_QUORUM_TIMEOUT: Duration = Duration::from_secs(300);

/// Chunk size for streaming file contents.
pub const CHUNK_SIZE: usize = 64 * 1024;

const DEFAULT_REPLICATION_K: usize = 3;

/// Errors raised while assembling a [`NodeConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// `DFTP_SUBNET` is not set in the environment.
    #[error("{ENV_SUBNET} is not set")]
    SubnetMissing,
    /// The configured subnet is not a valid CIDR expression.
    #[error("invalid subnet {0:?}: {1}")]
    SubnetInvalid(String, ipnet::AddrParseError),
}

/// Per-node configuration shared by every role.
///
/// Construct with [`NodeConfig::new`] which reads the subnet from the
/// environment, then override individual fields with the `with_*` methods.
#[derive(Clone)]
pub struct NodeConfig {
    /// Unique node name; also the gossip coordinator tie-breaker.
    pub name: String,
    /// Address this node binds and advertises.
    pub ip: IpAddr,
    /// Control port for inter-node messages.
    pub control_port: u16,
    /// Subnet scanned for registry nodes.
    pub subnet: IpNet,
    /// Timeout for a single discovery probe.
    pub probe_timeout: Duration,
    /// Concurrent probe cap.
    pub probe_workers: usize,
    /// Interval between heartbeat rounds.
    pub heartbeat_interval: Duration,
    /// Structured logger; defaults to forwarding into the `log` crate.
    pub logger: slog::Logger,
}

impl NodeConfig {
    /// Builds a configuration for the node `name` at `ip`, reading the
    /// subnet from `DFTP_SUBNET`.
    pub fn new(name: &str, ip: IpAddr) -> Result<Self, ConfigError> {
        let raw = std::env::var(ENV_SUBNET).map_err(|_| ConfigError::SubnetMissing)?;
        let subnet = raw.parse().map_err(|e| ConfigError::SubnetInvalid(raw, e))?;
        Ok(Self::with_subnet(name, ip, subnet))
    }

    /// Builds a configuration with an explicit subnet, bypassing the
    /// environment.
    pub fn with_subnet(name: &str, ip: IpAddr, subnet: IpNet) -> Self {
        NodeConfig {
            name: name.to_string(),
            ip,
            control_port: DEFAULT_CONTROL_PORT,
            subnet,
            probe_timeout: PROBE_TIMEOUT,
            probe_workers: PROBE_WORKERS,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            logger: default_logger(),
        }
    }

    /// Overrides the control port.
    pub fn control_port(mut self, port: u16) -> Self {
        self.control_port = port;
        self
    }

    /// Sets the structured logger ([slog](https://crates.io/crates/slog)::Logger) to use.
    pub fn logger<L: Into<Option<slog::Logger>>>(mut self, logger: L) -> Self {
        self.logger = logger.into().unwrap_or_else(default_logger);
        self
    }
}

impl std::fmt::Debug for NodeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConfig")
            .field("name", &self.name)
            .field("ip", &self.ip)
            .field("control_port", &self.control_port)
            .field("subnet", &self.subnet)
            .finish_non_exhaustive()
    }
}

fn default_logger() -> slog::Logger {
    slog::Logger::root(slog_stdlog::StdLog {}.fuse(), slog::o!())
}

/// The cluster-wide replication factor K, from `DATA_NODE_REPLICATION_K`.
///
/// A store is acknowledged `OK` once `min(K, replicas)` peers confirmed the
/// write; fewer acknowledgements degrade the reply to `partial`.
pub fn replication_factor() -> usize {
    std::env::var(ENV_REPLICATION_K)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_REPLICATION_K)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn config_with_subnet_defaults() {
        let cfg = NodeConfig::with_subnet("n1", "10.0.0.1".parse().unwrap(), "10.0.0.0/29".parse().unwrap());
        assert_eq!(cfg.control_port, DEFAULT_CONTROL_PORT);
        assert_eq!(cfg.probe_workers, PROBE_WORKERS);
        assert_eq!(cfg.heartbeat_interval, HEARTBEAT_INTERVAL);
    }

    #[test]
    fn config_overrides() {
        let cfg = NodeConfig::with_subnet("n1", "10.0.0.1".parse().unwrap(), "10.0.0.0/29".parse().unwrap()).control_port(9100);
        assert_eq!(cfg.control_port, 9100);
    }
}
