//! Preconditions a download job declares before it may start

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::core::config::{JobsConfig, RemoteConfig, StorageConfig};
use crate::core::error::{ComicError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConstraints {
    pub requires_network: bool,
    pub requires_storage_not_low: bool,
}

impl JobConstraints {
    pub async fn satisfied(&self, probe: &dyn EnvironmentProbe) -> bool {
        if self.requires_network && !probe.network_available().await {
            debug!("Network constraint not met");
            return false;
        }
        if self.requires_storage_not_low && probe.storage_low().await {
            debug!("Storage constraint not met");
            return false;
        }
        true
    }
}

impl From<&JobsConfig> for JobConstraints {
    fn from(config: &JobsConfig) -> Self {
        Self {
            requires_network: config.requires_network,
            requires_storage_not_low: config.requires_storage_not_low,
        }
    }
}

/// Answers questions about the host environment
#[async_trait]
pub trait EnvironmentProbe: Send + Sync {
    async fn network_available(&self) -> bool;

    async fn storage_low(&self) -> bool;
}

/// Probes the real machine: a TCP connect to the remote API host, and free
/// space on the volume that holds the storage root
pub struct HostProbe {
    host: String,
    port: u16,
    connect_timeout: Duration,
    storage_root: PathBuf,
    min_free_bytes: u64,
}

impl HostProbe {
    pub fn new(remote: &RemoteConfig, storage: &StorageConfig) -> Result<Self> {
        let url = url::Url::parse(&remote.base_url)
            .map_err(|e| ComicError::ConfigError(format!("Invalid remote base_url: {}", e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| ComicError::ConfigError("remote base_url has no host".to_string()))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| ComicError::ConfigError("remote base_url has no port".to_string()))?;

        Ok(Self {
            host,
            port,
            connect_timeout: remote.timeout().min(Duration::from_secs(5)),
            storage_root: storage.root_dir.clone(),
            min_free_bytes: storage.min_free_bytes,
        })
    }
}

#[async_trait]
impl EnvironmentProbe for HostProbe {
    async fn network_available(&self) -> bool {
        let connect = TcpStream::connect((self.host.as_str(), self.port));
        matches!(tokio::time::timeout(self.connect_timeout, connect).await, Ok(Ok(_)))
    }

    async fn storage_low(&self) -> bool {
        if self.min_free_bytes == 0 {
            return false;
        }
        let root = self.storage_root.clone();
        match tokio::task::spawn_blocking(move || free_bytes(&root)).await {
            Ok(Ok(free)) => free < self.min_free_bytes,
            Ok(Err(e)) => {
                warn!(path = %self.storage_root.display(), error = %e, "Could not read free space");
                false
            }
            Err(e) => {
                warn!(error = %e, "Free space probe panicked");
                false
            }
        }
    }
}

/// Free bytes available to unprivileged users on the volume holding `path`.
/// Walks up to the nearest existing ancestor so a not-yet-created storage
/// root still resolves to its volume.
#[cfg(unix)]
pub fn free_bytes(path: &Path) -> io::Result<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let existing = path
        .ancestors()
        .find(|p| p.exists())
        .unwrap_or_else(|| Path::new("."));
    let c_path = CString::new(existing.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64))
}

#[cfg(not(unix))]
pub fn free_bytes(_path: &Path) -> io::Result<u64> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "free space probe is unix-only"))
}

/// Probe with switchable answers, for tests and for running without checks
#[derive(Debug)]
pub struct StaticProbe {
    network: AtomicBool,
    storage_low: AtomicBool,
}

impl StaticProbe {
    pub fn new(network: bool, storage_low: bool) -> Self {
        Self {
            network: AtomicBool::new(network),
            storage_low: AtomicBool::new(storage_low),
        }
    }

    /// Network up, plenty of storage
    pub fn available() -> Self {
        Self::new(true, false)
    }

    pub fn set_network(&self, available: bool) {
        self.network.store(available, Ordering::SeqCst);
    }

    pub fn set_storage_low(&self, low: bool) {
        self.storage_low.store(low, Ordering::SeqCst);
    }
}

#[async_trait]
impl EnvironmentProbe for StaticProbe {
    async fn network_available(&self) -> bool {
        self.network.load(Ordering::SeqCst)
    }

    async fn storage_low(&self) -> bool {
        self.storage_low.load(Ordering::SeqCst)
    }
}
