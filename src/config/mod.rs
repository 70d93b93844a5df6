//! IPAM configuration snapshot
//!
//! The snapshot is built once per invocation from the network attachment
//! document (`{"cniVersion": ..., "ipam": {...}}`), optionally layered over a
//! flat-file overlay shared by every attachment on the host. Values in the
//! attachment document always win over the overlay.
//!
//! # Example
//!
//! ```json
//! {
//!   "cniVersion": "0.3.1",
//!   "name": "mynet",
//!   "type": "ipvlan",
//!   "ipam": {
//!     "type": "ipam-pool",
//!     "range": "192.168.1.5-192.168.1.25/24",
//!     "gateway": "192.168.1.1",
//!     "etcd_host": "http://127.0.0.1:2379"
//!   }
//! }
//! ```

mod range;

pub use range::{first_host, from_u128, host_net, last_host, to_u128, AddressRange};

use crate::error::{Error, Result};
use ::config::{File, FileFormat};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Overlay locations tried when the document names none
pub const DEFAULT_OVERLAY_PATHS: &[&str] = &[
    "/etc/cni/net.d/ipam-pool.d/ipam-pool.conf",
    "/etc/cni/net.d/ipam-pool.conf",
];

/// Retry budget for the read-compute-commit loop
pub const DEFAULT_DATASTORE_RETRIES: usize = 100;

/// Backend kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Datastore {
    Etcd,
    Kubernetes,
}

impl Default for Datastore {
    fn default() -> Self {
        Datastore::Etcd
    }
}

impl fmt::Display for Datastore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datastore::Etcd => write!(f, "etcd"),
            Datastore::Kubernetes => write!(f, "kubernetes"),
        }
    }
}

impl FromStr for Datastore {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "etcd" => Ok(Datastore::Etcd),
            "kubernetes" => Ok(Datastore::Kubernetes),
            other => Err(Error::Config(format!("unknown datastore: {}", other))),
        }
    }
}

/// etcd connection parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EtcdSettings {
    /// Comma-separated endpoint list
    pub host: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Key prefix for pool documents
    pub prefix: String,
}

impl EtcdSettings {
    pub fn endpoints(&self) -> Vec<String> {
        self.host
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                if s.contains("://") {
                    s.to_string()
                } else {
                    format!("http://{}", s)
                }
            })
            .collect()
    }
}

/// Kubernetes connection parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KubernetesSettings {
    /// Explicit kubeconfig; in-cluster or default inference otherwise
    pub kubeconfig: Option<PathBuf>,
    /// Namespace holding the pool resources; the client's default otherwise
    pub namespace: Option<String>,
}

/// Immutable configuration for one orchestrator call
#[derive(Debug, Clone)]
pub struct IpamConfig {
    pub range: AddressRange,
    pub datastore: Datastore,
    pub etcd: EtcdSettings,
    pub kubernetes: KubernetesSettings,
    /// Session keep-alive interval, seconds
    pub lease_duration: u64,
    /// Session keep-alive timeout, milliseconds
    pub backoff: u64,
    /// Bounds backend construction and health check
    pub lock_request_timeout: Duration,
    /// Bounds the whole retry loop
    pub request_timeout: Duration,
    /// Bounds session release
    pub close_timeout: Duration,
    pub datastore_retries: usize,
    pub log_file: Option<PathBuf>,
    pub log_level: Option<String>,
}

impl IpamConfig {
    /// Snapshot with default backend settings for `range`
    pub fn for_range(range: AddressRange) -> Self {
        Self {
            range,
            datastore: Datastore::default(),
            etcd: EtcdSettings {
                prefix: "/ipam-pool".to_string(),
                ..Default::default()
            },
            kubernetes: KubernetesSettings::default(),
            lease_duration: 10,
            backoff: 1000,
            lock_request_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(10),
            datastore_retries: DEFAULT_DATASTORE_RETRIES,
            log_file: None,
            log_level: None,
        }
    }

    /// Normalized CIDR, the pool key
    pub fn cidr(&self) -> IpNet {
        self.range.cidr
    }

    /// Load from a network attachment document
    ///
    /// Returns the snapshot and the document's CNI version. `overlay_path`
    /// is used when the document does not name a `configuration_path`.
    pub fn load(netconf: &[u8], overlay_path: Option<&Path>) -> Result<(Self, String)> {
        let doc: NetConf = serde_json::from_slice(netconf)
            .map_err(|e| Error::Config(format!("invalid network configuration: {}", e)))?;
        let ipam = doc
            .ipam
            .ok_or_else(|| Error::Config("network configuration has no ipam section".into()))?;

        let declared: DeclaredPath = serde_json::from_value(ipam.clone())
            .map_err(|e| Error::Config(format!("invalid ipam section: {}", e)))?;
        let overlay = declared
            .configuration_path
            .or_else(|| overlay_path.map(Path::to_path_buf))
            .or_else(|| {
                DEFAULT_OVERLAY_PATHS
                    .iter()
                    .map(PathBuf::from)
                    .find(|p| p.exists())
            });

        let mut builder = ::config::Config::builder();
        if let Some(path) = overlay.as_ref() {
            debug!(path = %path.display(), "Layering flat-file configuration");
            builder = builder.add_source(File::from(path.as_path()).format(FileFormat::Json));
        }
        builder = builder.add_source(File::from_str(&ipam.to_string(), FileFormat::Json));

        let raw: RawIpamConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::Config(e.to_string()))?;

        let config = Self::from_raw(raw)?;
        Ok((config, doc.cni_version.unwrap_or_else(|| "0.3.1".to_string())))
    }

    fn from_raw(raw: RawIpamConfig) -> Result<Self> {
        let range = raw
            .range
            .as_deref()
            .ok_or_else(|| Error::Config("ipam.range is required".into()))?;
        let exclude = raw
            .exclude
            .iter()
            .map(|s| parse_exclude(s))
            .collect::<Result<Vec<_>>>()?;
        let range = AddressRange::parse(
            range,
            parse_ip(raw.range_start.as_deref(), "range_start")?,
            parse_ip(raw.range_end.as_deref(), "range_end")?,
            parse_ip(raw.gateway.as_deref(), "gateway")?,
            exclude,
        )?;

        let mut config = Self::for_range(range);
        if let Some(datastore) = raw.datastore.as_deref() {
            config.datastore = datastore.parse()?;
        }
        config.etcd.host = raw.etcd_host.unwrap_or_default();
        config.etcd.username = raw.etcd_username;
        config.etcd.password = raw.etcd_password;
        if let Some(prefix) = raw.etcd_prefix {
            config.etcd.prefix = prefix;
        }
        config.kubernetes = KubernetesSettings {
            kubeconfig: raw.kubernetes.kubeconfig,
            namespace: raw.kubernetes.namespace,
        };
        config.lease_duration = raw.lease_duration.unwrap_or(config.lease_duration);
        config.backoff = raw.backoff.unwrap_or(config.backoff);
        if let Some(secs) = raw.lock_request_timeout {
            config.lock_request_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = raw.request_timeout {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = raw.close_timeout {
            config.close_timeout = Duration::from_secs(secs);
        }
        if let Some(retries) = raw.datastore_retries {
            if retries == 0 {
                return Err(Error::Config("datastore_retries must be at least 1".into()));
            }
            config.datastore_retries = retries;
        }
        config.log_file = raw.log_file;
        config.log_level = raw.log_level;

        if config.datastore == Datastore::Etcd && config.etcd.host.is_empty() {
            return Err(Error::Config("etcd_host is required for the etcd datastore".into()));
        }

        Ok(config)
    }
}

fn parse_ip(value: Option<&str>, field: &str) -> Result<Option<IpAddr>> {
    value
        .map(|s| {
            s.trim()
                .parse::<IpAddr>()
                .map_err(|e| Error::Config(format!("invalid {} {:?}: {}", field, s, e)))
        })
        .transpose()
}

/// Exclusions accept a CIDR or a bare address
fn parse_exclude(value: &str) -> Result<IpNet> {
    let value = value.trim();
    value
        .parse::<IpNet>()
        .map(|net| net.trunc())
        .or_else(|_| value.parse::<IpAddr>().map(host_net))
        .map_err(|e| Error::Config(format!("invalid exclude entry {:?}: {}", value, e)))
}

#[derive(Debug, Deserialize)]
struct NetConf {
    #[serde(rename = "cniVersion")]
    cni_version: Option<String>,
    ipam: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct DeclaredPath {
    configuration_path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct RawKubernetes {
    kubeconfig: Option<PathBuf>,
    namespace: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawIpamConfig {
    range: Option<String>,
    range_start: Option<String>,
    range_end: Option<String>,
    gateway: Option<String>,
    #[serde(default)]
    exclude: Vec<String>,
    datastore: Option<String>,
    etcd_host: Option<String>,
    etcd_username: Option<String>,
    etcd_password: Option<String>,
    etcd_prefix: Option<String>,
    #[serde(default)]
    kubernetes: RawKubernetes,
    lease_duration: Option<u64>,
    backoff: Option<u64>,
    lock_request_timeout: Option<u64>,
    request_timeout: Option<u64>,
    close_timeout: Option<u64>,
    datastore_retries: Option<usize>,
    log_file: Option<PathBuf>,
    log_level: Option<String>,
}
