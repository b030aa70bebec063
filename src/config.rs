use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigError;

#[derive(Parser, Debug)]
#[command(name = "bucketfs", about = "Mount object-storage buckets as local drives")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Mount every saved bucket and wait for ctrl-C
    Mount {
        /// Saved mount configuration
        #[arg(long)]
        config: Option<PathBuf>,

        /// Log file path
        #[arg(long, default_value = "/tmp/bucketfs.log")]
        log_file: PathBuf,

        /// Seconds a bucket listing is trusted before it is fetched again
        #[arg(long, default_value_t = 60)]
        listing_ttl_secs: u64,
    },
    /// Save a bucket mount
    Add {
        /// Local directory the bucket is mounted on
        mountpoint: PathBuf,

        /// Bucket name
        bucket: String,

        #[command(flatten)]
        access: AccessArgs,

        /// Saved mount configuration
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// List saved bucket mounts
    List {
        /// Saved mount configuration
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Forget a saved bucket mount
    Remove {
        /// Mount point of the saved entry
        mountpoint: PathBuf,

        /// Saved mount configuration
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Detach a mount left behind by another process
    Unmount {
        /// Path to the mount point
        mountpoint: PathBuf,
    },
}

#[derive(Args, Debug)]
#[group(required = true, multiple = true)]
pub struct AccessArgs {
    /// Satellite (or gateway) address; `memory://` and `file://` select local backends
    #[arg(long, requires_all = ["api_key", "passphrase"], conflicts_with = "access_grant")]
    pub satellite: Option<String>,

    #[arg(long)]
    pub api_key: Option<String>,

    #[arg(long)]
    pub passphrase: Option<String>,

    /// Serialized access grant
    #[arg(long)]
    pub access_grant: Option<String>,
}

impl AccessArgs {
    pub fn into_credentials(self) -> Result<Credentials, ConfigError> {
        match (self.access_grant, self.satellite, self.api_key, self.passphrase) {
            (Some(grant), None, _, _) => Ok(Credentials::AccessGrant { grant }),
            (None, Some(address), Some(api_key), Some(passphrase)) => Ok(Credentials::Satellite {
                address,
                api_key,
                passphrase,
            }),
            _ => Err(ConfigError::Invalid(
                "either --access-grant or --satellite/--api-key/--passphrase is required".into(),
            )),
        }
    }
}

/// How a mount authenticates against the store.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Credentials {
    Satellite {
        address: String,
        api_key: String,
        passphrase: String,
    },
    AccessGrant {
        grant: String,
    },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Satellite { address, .. } => f
                .debug_struct("Satellite")
                .field("address", address)
                .field("api_key", &"<redacted>")
                .field("passphrase", &"<redacted>")
                .finish(),
            Credentials::AccessGrant { .. } => f
                .debug_struct("AccessGrant")
                .field("grant", &"<redacted>")
                .finish(),
        }
    }
}

/// One bucket mount. The mount point is the drive identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MountDescriptor {
    pub mountpoint: PathBuf,
    pub bucket: String,
    pub credentials: Credentials,
}

impl MountDescriptor {
    pub fn drive(&self) -> String {
        self.mountpoint.display().to_string()
    }
}

/// Tunables for one mounted bucket.
#[derive(Debug, Clone)]
pub struct FsSettings {
    pub listing_ttl: Duration,
    pub download_ttl: Duration,
    pub total_bytes: u64,
    pub free_bytes: u64,
}

impl Default for FsSettings {
    fn default() -> Self {
        Self {
            listing_ttl: Duration::from_secs(60),
            download_ttl: Duration::from_secs(30 * 60),
            total_bytes: 1024 * 1024 * 1024,
            free_bytes: 512 * 1024 * 1024,
        }
    }
}

/// Saved mounts, kept as a JSON array on disk.
#[derive(Debug, Clone)]
pub struct MountConfig {
    path: PathBuf,
}

impl MountConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("bucketfs")
            .join("mounts.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load saved mounts. A missing or unreadable file means no saved mounts.
    pub fn load(&self) -> Vec<MountDescriptor> {
        match self.try_load() {
            Ok(mounts) => mounts,
            Err(e) => {
                warn!("ignoring saved mounts at {}: {}", self.path.display(), e);
                Vec::new()
            }
        }
    }

    pub fn try_load(&self) -> Result<Vec<MountDescriptor>, ConfigError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn save(&self, mounts: &[MountDescriptor]) -> Result<(), ConfigError> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let raw = serde_json::to_string_pretty(mounts)?;
        std::fs::write(&self.path, raw)?;
        // Credentials are stored in the clear; keep the file private.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    /// Add a mount, replacing any saved entry for the same mount point.
    pub fn add(&self, descriptor: MountDescriptor) -> Result<(), ConfigError> {
        let mut mounts = self.try_load()?;
        mounts.retain(|m| m.mountpoint != descriptor.mountpoint);
        mounts.push(descriptor);
        self.save(&mounts)
    }

    /// Returns whether an entry was removed.
    pub fn remove(&self, mountpoint: &Path) -> Result<bool, ConfigError> {
        let mut mounts = self.try_load()?;
        let before = mounts.len();
        mounts.retain(|m| m.mountpoint != mountpoint);
        if mounts.len() == before {
            return Ok(false);
        }
        self.save(&mounts)?;
        Ok(true)
    }
}
