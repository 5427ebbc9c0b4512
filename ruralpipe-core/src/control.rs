//! Configuration records and runtime statistics.
//!
//! The client and server daemons persist their settings as TOML records in
//! the platform configuration directory. Both records implement
//! [`ConfigRecord`], which carries the shared load/save plumbing, so the
//! binaries only decide which record they speak.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::proto::SessionId;

/// Errors from loading or persisting a configuration record.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not determine the platform config directory")]
    NoConfigDirectory,

    #[error("config already exists at {} (use --force to overwrite)", .0.display())]
    AlreadyExists(PathBuf),

    #[error("failed to access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// A daemon settings record persisted as a TOML file.
///
/// A missing file loads as the default settings, so the daemons run without
/// any configuration step.
pub trait ConfigRecord: Serialize + DeserializeOwned + Default {
    /// File name under the platform configuration directory.
    const FILE_NAME: &'static str;

    fn default_path() -> Result<PathBuf, ConfigError> {
        let dirs =
            ProjectDirs::from("org", "RuralPipe", "ruralpipe").ok_or(ConfigError::NoConfigDirectory)?;
        Ok(dirs.config_dir().join(Self::FILE_NAME))
    }

    fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn save(&self, path: &Path, overwrite: bool) -> Result<(), ConfigError> {
        if path.exists() && !overwrite {
            return Err(ConfigError::AlreadyExists(path.to_path_buf()));
        }

        let io_error = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        let raw = toml::to_string_pretty(self)?;
        fs::write(path, raw).map_err(io_error)
    }
}

/// Configuration for the client daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server host name or address.
    pub server_host: String,
    /// Server TCP port.
    pub server_port: u16,
    /// Uplink interfaces to establish one connection on each. An empty list
    /// means a single connection over the default route.
    pub interfaces: Vec<String>,
    /// Name of the tunnel device to create.
    pub tun_name: String,
    /// Number of queues to open on the tunnel device.
    pub num_queues: usize,
    /// Base64 key for the keyed frame-signing profile. Both ends must agree.
    pub signing_key_b64: Option<String>,
    /// How often to log transfer statistics.
    pub stats_interval_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_host: "127.0.0.1".to_string(),
            server_port: 50665,
            interfaces: Vec::new(),
            tun_name: "rpic".to_string(),
            num_queues: 2,
            signing_key_b64: None,
            stats_interval_secs: 30,
        }
    }
}

/// Configuration for the server daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on.
    pub listen_addr: String,
    /// TCP port to listen on.
    pub listen_port: u16,
    /// Name of the tunnel device to create.
    pub tun_name: String,
    /// Number of queues to open on the tunnel device.
    pub num_queues: usize,
    /// Base64 key for the keyed frame-signing profile. Both ends must agree.
    pub signing_key_b64: Option<String>,
    /// How often to log transfer statistics.
    pub stats_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            listen_port: 50665,
            tun_name: "rpis".to_string(),
            num_queues: 2,
            signing_key_b64: None,
            stats_interval_secs: 30,
        }
    }
}

impl ConfigRecord for ClientConfig {
    const FILE_NAME: &'static str = "ruralpipe-client.toml";
}

impl ConfigRecord for ServerConfig {
    const FILE_NAME: &'static str = "ruralpipe-server.toml";
}

/// Per-queue transfer counters of the tunnel device side.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
}

#[derive(Debug, Clone, Default)]
pub struct TunnelStats {
    pub queues: Vec<QueueStats>,
}

/// Counters of one stream of a session.
#[derive(Debug, Clone)]
pub struct StreamStats {
    pub bytes_sent: u64,
    pub bytes_sending: u64,
    pub in_use: bool,
}

#[derive(Debug, Clone)]
pub struct SessionStats {
    pub session_id: SessionId,
    pub next_seq_num: u64,
    pub streams: Vec<StreamStats>,
}

#[derive(Debug, Clone, Default)]
pub struct SocketStats {
    pub sessions: Vec<SessionStats>,
}
