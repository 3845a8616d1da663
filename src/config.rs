//! Configuration management for gossipvote.
//!
//! Each process role is started from positional parameters; the optional
//! YAML file only carries the shared defaults below.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{GossipVoteError, Result};
use crate::protocol::Identity;

/// Shared settings for every process role.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GossipVoteConfig {
    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Log channel configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Host every process binds to and connects on
    #[serde(default = "default_host")]
    pub host: IpAddr,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

/// Log channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Total send attempts before a log line is given up on
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Receive buffer size for the log receiver
    #[serde(default = "default_max_datagram_bytes")]
    pub max_datagram_bytes: usize,

    /// Directory the log receiver writes its file into
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            max_datagram_bytes: default_max_datagram_bytes(),
            log_dir: default_log_dir(),
        }
    }
}

fn default_max_attempts() -> u32 {
    4
}

fn default_max_datagram_bytes() -> usize {
    1024
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(".")
}

impl GossipVoteConfig {
    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GossipVoteConfig =
            serde_yaml::from_str(yaml).map_err(|e| GossipVoteError::Config(e.to_string()))?;
        if config.logging.max_attempts == 0 {
            return Err(GossipVoteError::Config(
                "logging.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }
}

/// Coordinator runtime parameters.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub host: IpAddr,
    /// Port participants join on; also the coordinator's log tag
    pub port: u16,
    /// Number of participants to wait for
    pub participants: usize,
    /// Read timeout applied to each participant while awaiting its outcome
    pub timeout: Duration,
    /// Candidate choices published to every participant
    pub options: Vec<String>,
}

impl CoordinatorConfig {
    /// Reject parameter combinations the protocol cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.participants == 0 {
            return Err(GossipVoteError::Config(
                "expected participant count must be at least 1".to_string(),
            ));
        }
        if self.options.is_empty() {
            return Err(GossipVoteError::Config(
                "at least one vote option is required".to_string(),
            ));
        }
        if let Some(bad) = self
            .options
            .iter()
            .find(|o| o.is_empty() || o.chars().any(char::is_whitespace))
        {
            return Err(GossipVoteError::Config(format!(
                "vote option `{}` must be a single token",
                bad
            )));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// Participant runtime parameters.
#[derive(Debug, Clone)]
pub struct ParticipantConfig {
    pub host: IpAddr,
    pub coordinator_port: u16,
    /// Own listening port, which is also this participant's identity
    pub port: Identity,
    /// Applied to connects, the mesh discovery window and every round
    pub timeout: Duration,
}

impl ParticipantConfig {
    pub fn coordinator_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.coordinator_port)
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn peer_addr(&self, peer: Identity) -> SocketAddr {
        SocketAddr::new(self.host, peer)
    }
}

/// Log channel sender parameters.
#[derive(Debug, Clone)]
pub struct LogClientConfig {
    /// Where the log receiver listens
    pub server_addr: SocketAddr,
    /// Tag prefixed to every line, normally the sender's identity
    pub tag: Identity,
    /// How long to wait for each acknowledgement
    pub ack_timeout: Duration,
    pub max_attempts: u32,
    /// Largest payload the receiver reads in one datagram
    pub max_datagram_bytes: usize,
}

impl LogClientConfig {
    /// Upper bound on how long one line can stay unacknowledged.
    ///
    /// Saturates instead of overflowing for huge timeouts.
    pub fn delivery_window(&self) -> Duration {
        self.ack_timeout
            .checked_mul(self.max_attempts)
            .unwrap_or(Duration::MAX)
    }
}

/// Log receiver parameters.
#[derive(Debug, Clone)]
pub struct LogServerConfig {
    pub listen_addr: SocketAddr,
    pub max_datagram_bytes: usize,
    pub log_dir: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GossipVoteConfig::default();
        assert_eq!(config.network.host, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.logging.max_attempts, 4);
        assert_eq!(config.logging.max_datagram_bytes, 1024);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
logging:
  log_dir: /var/log/gossipvote
"#;
        let config = GossipVoteConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.logging.log_dir, PathBuf::from("/var/log/gossipvote"));
        assert_eq!(config.logging.max_attempts, 4);
        assert_eq!(config.network.host, IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn test_delivery_window_saturates() {
        let mut config = LogClientConfig {
            server_addr: SocketAddr::new(default_host(), 4999),
            tag: 5001,
            ack_timeout: Duration::from_millis(250),
            max_attempts: 4,
            max_datagram_bytes: 1024,
        };
        assert_eq!(config.delivery_window(), Duration::from_secs(1));

        config.ack_timeout = Duration::from_millis(u64::MAX);
        assert_eq!(config.delivery_window(), Duration::MAX);
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let yaml = "logging:\n  max_attempts: 0\n";
        assert!(matches!(
            GossipVoteConfig::from_yaml(yaml),
            Err(GossipVoteError::Config(_))
        ));
    }

    fn coordinator(options: &[&str], participants: usize) -> CoordinatorConfig {
        CoordinatorConfig {
            host: default_host(),
            port: 4000,
            participants,
            timeout: Duration::from_millis(500),
            options: options.iter().map(|o| o.to_string()).collect(),
        }
    }

    #[test]
    fn test_coordinator_validation() {
        assert!(coordinator(&["yes", "no"], 3).validate().is_ok());
        assert!(coordinator(&[], 3).validate().is_err());
        assert!(coordinator(&["yes"], 0).validate().is_err());
        assert!(coordinator(&["two words"], 3).validate().is_err());
    }
}
