use std::{net::SocketAddr, path::PathBuf, time::Duration};

use directories::{ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};
use tokio::{
    fs::{create_dir_all, read_to_string, write},
    io,
};
use tracing::warn;

use crate::{encryption::EncryptionPolicy, error::Error};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub download_dir: PathBuf,
    pub resume_dir: PathBuf,
    pub listen_addr: SocketAddr,
    /// Connected peers of a single torrent.
    pub max_torrent_peers: usize,
    /// Connected peers of all torrents.
    pub max_global_peers: usize,
    /// Peers unchoked by rate, the optimistic unchoke is not counted.
    pub unchoke_slots: usize,
    /// Bytes per second, 0 is unlimited.
    pub upload_limit: u64,
    /// Bytes per second, 0 is unlimited.
    pub download_limit: u64,
    pub encryption: EncryptionPolicy,
    pub dht_enabled: bool,
    pub anonymous_mode: bool,
    /// Block the reserved IPv4 ranges.
    pub block_reserved_ranges: bool,
    pub connect_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    /// The longest a request can wait for its block. The timeout adapts to
    /// the latency of each peer, but never goes above this.
    pub request_timeout_secs: u64,
    /// Consecutive request timeouts before a peer is dropped.
    pub max_request_timeouts: usize,
    pub snapshot_interval_ms: u64,
    /// Write logs to a file in the data dir.
    pub log: bool,
}

impl Default for Config {
    fn default() -> Self {
        let download_dir = UserDirs::new()
            .and_then(|d| d.download_dir().map(|d| d.to_path_buf()))
            .unwrap_or_else(|| std::env::temp_dir().join("brisa"));

        let resume_dir = Self::project_dirs()
            .map(|d| d.data_dir().join("resume"))
            .unwrap_or_else(|| std::env::temp_dir().join("brisa").join("resume"));

        Self {
            download_dir,
            resume_dir,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 51413)),
            max_torrent_peers: 50,
            max_global_peers: 500,
            unchoke_slots: 4,
            upload_limit: 0,
            download_limit: 0,
            encryption: EncryptionPolicy::Enabled,
            dht_enabled: true,
            anonymous_mode: false,
            block_reserved_ranges: true,
            connect_timeout_secs: 10,
            handshake_timeout_secs: 10,
            request_timeout_secs: 20,
            max_request_timeouts: 3,
            snapshot_interval_ms: 1000,
            log: false,
        }
    }
}

impl Config {
    pub fn project_dirs() -> Option<ProjectDirs> {
        ProjectDirs::from("", "", "brisa")
    }

    /// Path of the configuration file, `<config dir>/brisa/config.toml`.
    pub fn config_path() -> Result<PathBuf, Error> {
        let dirs = Self::project_dirs().ok_or(Error::HomeInvalid)?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Load the configuration file.
    ///
    /// If the file does not exist, or it is not valid, it is replaced with
    /// the default configuration.
    pub async fn load() -> Result<Self, Error> {
        let path = Self::config_path()?;

        let config = match read_to_string(&path).await {
            Ok(s) => match toml::from_str::<Config>(&s) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    warn!("invalid config file {path:?}, using defaults: {e}");
                    Config::default()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Config::default(),
            Err(e) => return Err(e.into()),
        };

        if let Some(dir) = path.parent() {
            create_dir_all(dir)
                .await
                .map_err(|_| Error::FolderOpenError(dir.display().to_string()))?;
        }
        write(&path, toml::to_string(&config)?).await?;

        Ok(config)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.listen_addr.port(), 51413);
        assert_eq!(config.max_torrent_peers, 50);
        assert_eq!(config.unchoke_slots, 4);
        assert_eq!(config.encryption, EncryptionPolicy::Enabled);
        assert_eq!(config.request_timeout(), Duration::from_secs(20));
    }

    #[test]
    fn partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            upload_limit = 1024
            encryption = "required"
            "#,
        )
        .unwrap();
        assert_eq!(config.upload_limit, 1024);
        assert_eq!(config.encryption, EncryptionPolicy::Required);
        assert_eq!(config.max_request_timeouts, 3);

        let s = toml::to_string(&config).unwrap();
        assert_eq!(toml::from_str::<Config>(&s).unwrap(), config);
    }
}
