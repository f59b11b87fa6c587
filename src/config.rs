//! Configuration management for the overlay daemon.
//!
//! Configuration lives in a TOML file with three sections: `[node]`,
//! `[timing]` and `[logging]`. Only `[node]` is required; the other sections
//! fall back to the protocol defaults in `constants::timing`.
//!
//! ```toml
//! [node]
//! role = "peer"
//! listen_address = "127.0.0.1:6060"
//! root_address = "127.0.0.1:5050"
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::address::Address;
use crate::constants::timing;
use crate::error::AppError;
use crate::peer::{PeerOptions, Role};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// "root" or "peer"
    #[serde(default = "default_role")]
    pub role: String,
    /// Bind address of the transport server, "ip:port"
    pub listen_address: String,
    /// Address written into packet headers; defaults to `listen_address`
    #[serde(default)]
    pub advertised_address: Option<String>,
    /// Required for peers
    #[serde(default)]
    pub root_address: Option<String>,
    /// Register and advertise as soon as the daemon starts
    #[serde(default = "default_true")]
    pub auto_join: bool,
}

fn default_role() -> String {
    "root".to_string()
}

fn default_true() -> bool {
    true
}

impl NodeConfig {
    pub fn role(&self) -> Role {
        match self.role.to_lowercase().as_str() {
            "root" => Role::Root,
            _ => Role::Leaf,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_reunion_interval_secs")]
    pub reunion_interval_secs: u64,
    /// Root expires a node after this long without a hello
    #[serde(default = "default_root_heartbeat_timeout_secs")]
    pub root_heartbeat_timeout_secs: u64,
    /// Peer declares reunion failure when hello-back lags hello by more than this
    #[serde(default = "default_peer_pending_timeout_secs")]
    pub peer_pending_timeout_secs: u64,
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
}

fn default_tick_interval_ms() -> u64 {
    timing::TICK_INTERVAL_MS
}

fn default_reunion_interval_secs() -> u64 {
    timing::REUNION_INTERVAL_SECS
}

fn default_root_heartbeat_timeout_secs() -> u64 {
    timing::ROOT_HEARTBEAT_TIMEOUT_SECS
}

fn default_peer_pending_timeout_secs() -> u64 {
    timing::PEER_PENDING_TIMEOUT_SECS
}

fn default_send_timeout_secs() -> u64 {
    timing::SEND_TIMEOUT_SECS
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            reunion_interval_secs: default_reunion_interval_secs(),
            root_heartbeat_timeout_secs: default_root_heartbeat_timeout_secs(),
            peer_pending_timeout_secs: default_peer_pending_timeout_secs(),
            send_timeout_secs: default_send_timeout_secs(),
        }
    }
}

impl TimingConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn reunion_interval(&self) -> Duration {
        Duration::from_secs(self.reunion_interval_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn default() -> Self {
        Self {
            node: NodeConfig {
                role: default_role(),
                listen_address: "127.0.0.1:5050".to_string(),
                advertised_address: None,
                root_address: None,
                auto_join: true,
            },
            timing: TimingConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load `path`, or write the defaults there first if it does not exist.
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        if path.exists() {
            Self::load_from_file(path)
        } else {
            let config = Config::default();
            config.save_to_file(path)?;
            tracing::info!("📝 Wrote default configuration to {}", path.display());
            Ok(config)
        }
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), AppError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn role(&self) -> Role {
        self.node.role()
    }

    /// Address this node puts in packet headers.
    pub fn advertised_address(&self) -> Result<Address, AppError> {
        let raw = self
            .node
            .advertised_address
            .as_deref()
            .unwrap_or(&self.node.listen_address);
        Ok(raw.parse()?)
    }

    /// The root's address; for the root itself that is its advertised address.
    pub fn root_address(&self) -> Result<Address, AppError> {
        match self.role() {
            Role::Root => self.advertised_address(),
            Role::Leaf => match &self.node.root_address {
                Some(raw) => Ok(raw.parse()?),
                None => Err(AppError::Config(
                    "node.root_address is required for peers".to_string(),
                )),
            },
        }
    }

    pub fn peer_options(&self) -> PeerOptions {
        PeerOptions {
            auto_join: self.node.auto_join,
            root_heartbeat_timeout: Duration::from_secs(self.timing.root_heartbeat_timeout_secs),
            peer_pending_timeout: Duration::from_secs(self.timing.peer_pending_timeout_secs),
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        match self.node.role.to_lowercase().as_str() {
            "root" | "peer" => {}
            other => {
                return Err(AppError::Config(format!(
                    "node.role must be \"root\" or \"peer\", got {:?}",
                    other
                )))
            }
        }

        self.node.listen_address.parse::<Address>()?;
        let advertised = self.advertised_address()?;
        if advertised.ip() == [0, 0, 0, 0] {
            return Err(AppError::Config(
                "node.advertised_address must be set when listening on 0.0.0.0".to_string(),
            ));
        }

        let root = self.root_address()?;
        if self.role() == Role::Leaf && root == advertised {
            return Err(AppError::Config(
                "a peer cannot use its own address as the root".to_string(),
            ));
        }

        let t = &self.timing;
        if t.tick_interval_ms == 0 || t.reunion_interval_secs == 0 || t.send_timeout_secs == 0 {
            return Err(AppError::Config("timing intervals must be non-zero".to_string()));
        }
        if t.root_heartbeat_timeout_secs <= t.reunion_interval_secs {
            return Err(AppError::Config(format!(
                "timing.root_heartbeat_timeout_secs ({}) must exceed reunion_interval_secs ({})",
                t.root_heartbeat_timeout_secs, t.reunion_interval_secs
            )));
        }
        if t.peer_pending_timeout_secs <= t.reunion_interval_secs {
            return Err(AppError::Config(format!(
                "timing.peer_pending_timeout_secs ({}) must exceed reunion_interval_secs ({})",
                t.peer_pending_timeout_secs, t.reunion_interval_secs
            )));
        }

        match self.logging.format.as_str() {
            "pretty" | "json" => Ok(()),
            other => Err(AppError::Config(format!(
                "logging.format must be \"pretty\" or \"json\", got {:?}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer_config() -> Config {
        let mut config = Config::default();
        config.node.role = "peer".to_string();
        config.node.listen_address = "127.0.0.1:6060".to_string();
        config.node.root_address = Some("127.0.0.1:5050".to_string());
        config
    }

    #[test]
    fn test_default_is_valid_root() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.role(), Role::Root);
        assert_eq!(
            config.root_address().unwrap(),
            Address::new([127, 0, 0, 1], 5050)
        );
        assert_eq!(config.timing.tick_interval(), Duration::from_secs(2));
        assert_eq!(config.timing.reunion_interval(), Duration::from_secs(4));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overlay.toml");

        let config = peer_config();
        config.save_to_file(&path).unwrap();
        let loaded = Config::load_from_file(&path).unwrap();

        assert_eq!(loaded.node.role, "peer");
        assert_eq!(loaded.node.root_address.as_deref(), Some("127.0.0.1:5050"));
        assert_eq!(
            loaded.timing.peer_pending_timeout_secs,
            timing::PEER_PENDING_TIMEOUT_SECS
        );
        loaded.validate().unwrap();
    }

    #[test]
    fn test_load_or_create_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("overlay.toml");
        assert!(!path.exists());

        let created = Config::load_or_create(&path).unwrap();
        assert!(path.exists());
        assert_eq!(created.node.listen_address, "127.0.0.1:5050");

        let again = Config::load_or_create(&path).unwrap();
        assert_eq!(again.node.listen_address, created.node.listen_address);
    }

    #[test]
    fn test_minimal_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overlay.toml");
        fs::write(
            &path,
            "[node]\nrole = \"peer\"\nlisten_address = \"10.0.0.2:6000\"\nroot_address = \"10.0.0.1:5050\"\n",
        )
        .unwrap();

        let config = Config::load_from_file(&path).unwrap();
        config.validate().unwrap();
        assert!(config.node.auto_join);
        assert_eq!(config.logging.format, "pretty");
        assert_eq!(config.timing.root_heartbeat_timeout_secs, 24);
        assert_eq!(
            config.root_address().unwrap(),
            Address::new([10, 0, 0, 1], 5050)
        );
    }

    #[test]
    fn test_peer_needs_root_address() {
        let mut config = peer_config();
        config.node.root_address = None;
        assert!(matches!(config.validate(), Err(AppError::Config(_))));

        let mut config = peer_config();
        config.node.root_address = Some("127.0.0.1:6060".to_string());
        assert!(matches!(config.validate(), Err(AppError::Config(_))));

        let mut config = peer_config();
        config.node.root_address = Some("not-an-address".to_string());
        assert!(matches!(config.validate(), Err(AppError::Address(_))));
    }

    #[test]
    fn test_wildcard_listen_needs_advertised_address() {
        let mut config = Config::default();
        config.node.listen_address = "0.0.0.0:5050".to_string();
        assert!(config.validate().is_err());

        config.node.advertised_address = Some("192.168.1.10:5050".to_string());
        config.validate().unwrap();
        assert_eq!(
            config.advertised_address().unwrap(),
            Address::new([192, 168, 1, 10], 5050)
        );
    }

    #[test]
    fn test_timing_sanity() {
        let mut config = Config::default();
        config.timing.root_heartbeat_timeout_secs = 4;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.timing.tick_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_peer_options_follow_timing() {
        let mut config = peer_config();
        config.node.auto_join = false;
        config.timing.peer_pending_timeout_secs = 60;
        let options = config.peer_options();
        assert!(!options.auto_join);
        assert_eq!(options.peer_pending_timeout, Duration::from_secs(60));
    }
}
