//! Configuration management for ircdcc.
//!
//! This module handles loading, saving, and validating the DCC preferences
//! consumed by the transfer engine: where downloads land, which ports may be
//! bound, how our own address is announced, and how transfers pace themselves.
//!
//! ## Configuration File Locations
//!
//! | Platform | Path |
//! |----------|------|
//! | Linux | `~/.config/ircdcc/config.toml` |
//! | macOS | `~/Library/Application Support/org.ircdcc.ircdcc/config.toml` |
//! | Windows | `%APPDATA%\ircdcc\ircdcc\config\config.toml` |
//!
//! ## Example
//!
//! ```rust,ignore
//! use ircdcc_core::config::Config;
//!
//! let config = Config::load()?;
//! println!("Downloads go to {}", config.general.download_root().display());
//! ```

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::host::Authorizer;
use crate::protocol::AckByteOrder;

/// Main configuration struct for ircdcc.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Download destination settings
    pub general: GeneralConfig,
    /// Address and port settings
    pub network: NetworkConfig,
    /// Transfer pacing and negotiation settings
    pub transfer: TransferConfig,
    /// What the local user may do
    pub policy: PolicyConfig,
    /// DCC chat settings
    pub chat: ChatConfig,
}

/// Where incoming files are stored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Root folder for downloads (platform download dir when unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_dir: Option<PathBuf>,
    /// Put each partner's files in a subfolder named after the nick
    pub create_partner_folder: bool,
    /// Prefix saved file names with `nick.`
    pub add_partner_prefix: bool,
}

impl GeneralConfig {
    /// The folder downloads default to.
    #[must_use]
    pub fn download_root(&self) -> PathBuf {
        if let Some(dir) = &self.download_dir {
            return dir.clone();
        }
        directories::UserDirs::new()
            .and_then(|dirs| {
                dirs.download_dir()
                    .map(Path::to_path_buf)
                    .or_else(|| Some(dirs.home_dir().to_path_buf()))
            })
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Address and listening-port settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address announced to peers, overriding every other source
    #[serde(skip_serializing_if = "Option::is_none")]
    pub own_ip: Option<IpAddr>,
    /// Prefer the address the IRC server reported for us
    pub use_server_reported_ip: bool,
    /// Inclusive port range for listening sockets (OS picks when unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_range: Option<(u16, u16)>,
    /// Enable TCP keep-alive on data sockets
    pub tcp_keepalive: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            own_ip: None,
            use_server_reported_ip: true,
            port_range: None,
            tcp_keepalive: true,
        }
    }
}

/// Transfer pacing and negotiation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Bytes read from the source file per chunk when sending
    pub buffer_size: usize,
    /// Keep writing without waiting for acknowledgements
    pub fast_send: bool,
    /// Offer sends in passive (reverse) mode by default
    pub passive_send: bool,
    /// Start incoming offers without asking
    pub auto_accept: bool,
    /// Resume partial files without asking
    pub auto_resume: bool,
    /// Replace spaces in outgoing file names with underscores
    pub space_to_underscore: bool,
    /// How long an outgoing offer waits for the peer
    #[serde(with = "humantime_serde")]
    pub send_timeout: Duration,
    /// How long resume and connect phases wait for the peer.
    ///
    /// Defaults to 30 seconds, the value every DCC client expects. It is a
    /// setting mainly so tests can expire a negotiation without waiting.
    #[serde(with = "humantime_serde")]
    pub negotiation_timeout: Duration,
    /// Byte order of the 4-byte acknowledgement
    pub ack_byte_order: AckByteOrder,
    /// Interval between speed samples
    #[serde(with = "humantime_serde")]
    pub speed_sample_interval: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            buffer_size: crate::DEFAULT_BUFFER_SIZE,
            fast_send: true,
            passive_send: false,
            auto_accept: false,
            auto_resume: false,
            space_to_underscore: false,
            send_timeout: Duration::from_secs(crate::DEFAULT_SEND_TIMEOUT_SECS),
            negotiation_timeout: Duration::from_secs(crate::NEGOTIATION_TIMEOUT_SECS),
            ack_byte_order: AckByteOrder::default(),
            speed_sample_interval: Duration::from_millis(crate::SPEED_SAMPLE_INTERVAL_MS),
        }
    }
}

/// DCC chat settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Accept chat offers without asking
    pub auto_accept: bool,
    /// Listening ports for chats; `network.port_range` applies when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_range: Option<(u16, u16)>,
}

impl ChatConfig {
    /// Ports a chat may listen on.
    #[must_use]
    pub fn listen_range(&self, network: &NetworkConfig) -> Option<(u16, u16)> {
        self.port_range.or(network.port_range)
    }
}

/// What the local user is allowed to do.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Allow offering files
    pub allow_sending: bool,
    /// Allow accepting files
    pub allow_receiving: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            allow_sending: true,
            allow_receiving: true,
        }
    }
}

impl Authorizer for PolicyConfig {
    fn may_send(&self) -> bool {
        self.allow_sending
    }

    fn may_receive(&self) -> bool {
        self.allow_receiving
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// If the configuration file doesn't exist, returns the default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::ConfigError(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location.
    ///
    /// Creates the configuration directory if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    /// Save configuration to an explicit path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::ConfigError(format!("Failed to create config directory: {e}"))
            })?;
        }

        std::fs::write(path, self.to_toml()?)
            .map_err(|e| Error::ConfigError(format!("Failed to write config: {e}")))
    }

    /// The configuration as it would be written to disk.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::ConfigError(format!("Failed to serialize config: {e}")))
    }

    /// Check values that serde alone cannot.
    pub fn validate(&self) -> Result<()> {
        for (key, range) in [
            ("network.port_range", self.network.port_range),
            ("chat.port_range", self.chat.port_range),
        ] {
            if let Some((first, last)) = range {
                if first == 0 || first > last {
                    return Err(Error::InvalidConfig {
                        key: key.to_string(),
                        reason: format!("{first}-{last} is not a usable range"),
                    });
                }
            }
        }
        if self.transfer.buffer_size == 0 {
            return Err(Error::InvalidConfig {
                key: "transfer.buffer_size".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.transfer.speed_sample_interval.is_zero() {
            return Err(Error::InvalidConfig {
                key: "transfer.speed_sample_interval".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Get the default configuration directory path.
    #[must_use]
    pub fn config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "ircdcc", "ircdcc")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the full path to the configuration file.
    #[must_use]
    pub fn config_path() -> PathBuf {
        Self::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("config.toml")
    }
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let (digits, scale) = if let Some(ms) = s.strip_suffix("ms") {
            (ms, 1)
        } else if let Some(secs) = s.strip_suffix('s') {
            (secs, 1000)
        } else if let Some(mins) = s.strip_suffix('m') {
            (mins, 60_000)
        } else {
            return Err(serde::de::Error::custom("invalid duration format"));
        };
        digits
            .trim()
            .parse::<u64>()
            .map(|n| Duration::from_millis(n * scale))
            .map_err(serde::de::Error::custom)
    }
}
