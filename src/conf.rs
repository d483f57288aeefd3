//! This module defines types used to configure the agent and its parts.

use std::env;
use std::path::PathBuf;

/// The TCP port the agent listens on. Fixed: the fleet addresses every node
/// on the same port.
pub const LISTEN_PORT: u16 = 2030;

/// Hash algorithm of the blobs ingested from the local content store.
pub const BLOB_ALGO: &str = "sha256";

const DEFAULT_BT_DIR: &str = "/var/lib/bt-agent";
const DEFAULT_BLOB_DIR: &str =
    "/var/lib/containerd/io.containerd.content.v1.content/blobs/sha256";
const DEFAULT_REGISTRY_URL: &str = "registry-1.docker.io";
const DEFAULT_TRACKER_URL: &str =
    "http://tracker.kube-system.svc.cluster.local:80/announce";
const DEFAULT_INDEX_URL: &str = "http://blob-index.kube-system.svc.cluster.local:80";

/// The global configuration for the agent, read once from the environment
/// at startup.
#[derive(Debug, Clone)]
pub struct Conf {
    /// Data directory managed by the torrent engine. Also the authoritative
    /// location for blobs that have been fully ingested.
    pub bt_dir: PathBuf,

    /// Source directory scanned at startup for pre-existing blobs to seed.
    pub blob_dir: PathBuf,

    /// Upstream registry for the reverse proxy and fallback pulls. A bare
    /// host implies https.
    pub registry_url: String,

    /// Tracker announce URL placed in every magnet link.
    pub tracker_url: String,

    /// Base URL of the digest -> infohash index service.
    pub index_url: String,
}

impl Conf {
    /// Reads the configuration from the environment, falling back to the
    /// documented defaults. Missing variables are logged.
    pub fn from_env() -> Self {
        Self {
            bt_dir: env_or("BT_DIR", DEFAULT_BT_DIR).into(),
            blob_dir: env_or("BLOB_DIR", DEFAULT_BLOB_DIR).into(),
            registry_url: env_or("REGISTRY_URL", DEFAULT_REGISTRY_URL),
            tracker_url: tracker_from_env(),
            index_url: env_or("INDEX_URL", DEFAULT_INDEX_URL),
        }
    }

    /// The registry base with an explicit scheme.
    pub fn registry_base(&self) -> String {
        registry_base(&self.registry_url)
    }
}

/// Normalizes the configured registry to a base URL with a scheme and no
/// trailing slash.
pub fn registry_base(registry_url: &str) -> String {
    let trimmed = registry_url.trim_end_matches('/');
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}

fn env_or(name: &str, default: &str) -> String {
    match env::var(name) {
        Ok(value) if !value.is_empty() => value,
        _ => {
            log::info!("{name} is not set, using default: {default}");
            default.to_string()
        }
    }
}

/// The tracker variable has two historical spellings; either is accepted.
fn tracker_from_env() -> String {
    env::var("TRACKER_ANNOUNCEMENT")
        .ok()
        .filter(|v| !v.is_empty())
        .or_else(|| env::var("TRACKER_ANNOUNCE_URL").ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| {
            log::info!("TRACKER_ANNOUNCEMENT is not set, using default: {DEFAULT_TRACKER_URL}");
            DEFAULT_TRACKER_URL.to_string()
        })
}
