use std::{
    collections::{HashMap, HashSet},
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use anyhow::{anyhow, Result};
use blob_store::{BackendConfig, FileSystemConfig};
use data_model::{NamespaceId, NamespacePolicy};
use figment::{
    providers::{Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use url::Url;

const LOCAL_ENV: &str = "local";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub env: String,
    pub listen_addr: String,
    /// Name of the region/site this instance serves. Recorded in the blob
    /// index for every local write.
    pub region: String,
    /// JSON logs. Defaults to on outside the local environment.
    pub structured_logging: Option<bool>,
    pub telemetry: TelemetryConfig,
    pub storage: StorageConfig,
    pub blob_index: BlobIndexConfig,
    pub namespaces: HashMap<NamespaceId, NamespacePolicy>,
    pub peers: PeersConfig,
    pub credentials: CredentialsConfig,
    pub leader: LeaderConfig,
    pub consistency: ConsistencyConfig,
    pub filesystem_gc: FilesystemGcConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            env: LOCAL_ENV.to_string(),
            listen_addr: "0.0.0.0:8900".to_string(),
            region: "local".to_string(),
            structured_logging: None,
            telemetry: Default::default(),
            storage: Default::default(),
            blob_index: Default::default(),
            namespaces: HashMap::new(),
            peers: Default::default(),
            credentials: Default::default(),
            leader: Default::default(),
            consistency: Default::default(),
            filesystem_gc: Default::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_path(path: &str) -> Result<ServerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&config_str)
    }

    pub fn from_yaml_str(config_str: &str) -> Result<ServerConfig> {
        let config: ServerConfig = Figment::new().merge(Yaml::string(config_str)).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow!("invalid listen address: {}", self.listen_addr));
        }
        if self.region.is_empty() || self.region.contains('/') {
            return Err(anyhow!("invalid region name: {:?}", self.region));
        }

        let Some(root) = self.storage.backends.last() else {
            return Err(anyhow!("storage.backends must list at least one backend"));
        };
        if matches!(root, BackendConfig::Peer(_)) {
            return Err(anyhow!(
                "the last storage backend is the root store and cannot be a peer backend"
            ));
        }
        for backend in &self.storage.backends {
            if let BackendConfig::FileSystem(fs) = backend {
                validate_thresholds(fs)?;
            }
        }

        for (ns, policy) in &self.namespaces {
            if let Some(fallback) = &policy.fallback_namespace {
                if fallback == ns {
                    return Err(anyhow!("namespace {} cannot fall back to itself", ns));
                }
                if !self.namespaces.contains_key(fallback) {
                    return Err(anyhow!(
                        "namespace {} falls back to unknown namespace {}",
                        ns,
                        fallback
                    ));
                }
            }
        }
        self.validate_fallback_chains()?;

        for (name, check) in [
            ("blob_index", &self.consistency.blob_index),
            ("blob_store", &self.consistency.blob_store),
            ("ref_store", &self.consistency.ref_store),
        ] {
            if check.max_parallelism == 0 {
                return Err(anyhow!(
                    "consistency.{}.max_parallelism must be greater than 0",
                    name
                ));
            }
        }

        let mut region_names = HashSet::new();
        for region in &self.peers.regions {
            if region.name == self.region {
                return Err(anyhow!(
                    "peer region {} has the same name as this region",
                    region.name
                ));
            }
            if !region_names.insert(&region.name) {
                return Err(anyhow!("peer region {} is listed twice", region.name));
            }
        }
        Ok(())
    }

    fn validate_fallback_chains(&self) -> Result<()> {
        for start in self.namespaces.keys() {
            let mut seen = HashSet::from([start]);
            let mut current = start;
            while let Some(next) = self
                .namespaces
                .get(current)
                .and_then(|policy| policy.fallback_namespace.as_ref())
            {
                if !seen.insert(next) {
                    return Err(anyhow!(
                        "fallback namespaces starting at {} form a cycle",
                        start
                    ));
                }
                current = next;
            }
        }
        Ok(())
    }

    pub fn structured_logging(&self) -> bool {
        self.structured_logging.unwrap_or(self.env != LOCAL_ENV)
    }

    pub fn instance_id(&self) -> String {
        self.telemetry
            .instance_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.env, self.region))
    }
}

fn validate_thresholds(fs: &FileSystemConfig) -> Result<()> {
    let in_range = |v: f64| v > 0.0 && v <= 1.0;
    if !in_range(fs.trigger_threshold) || !in_range(fs.target_threshold) {
        return Err(anyhow!(
            "filesystem thresholds for {} must be in (0, 1]",
            fs.root.display()
        ));
    }
    if fs.target_threshold >= fs.trigger_threshold {
        return Err(anyhow!(
            "filesystem target threshold for {} must be below the trigger threshold",
            fs.root.display()
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    // Export spans over OTLP.
    pub enable_tracing: bool,
    // OTLP collector endpoint, the exporter default when unset.
    pub endpoint: Option<String>,
    pub instance_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Tiers, fastest first. The last one is the root store.
    pub backends: Vec<BackendConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backends: vec![BackendConfig::FileSystem(FileSystemConfig::new(
                PathBuf::from("blob_storage/blobs"),
            ))],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlobIndexConfig {
    Memory,
    Rocksdb { path: PathBuf },
}

impl Default for BlobIndexConfig {
    fn default() -> Self {
        BlobIndexConfig::Rocksdb {
            path: PathBuf::from("blob_storage/index"),
        }
    }
}

/// Another region's public endpoint, used for on-demand replication.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerRegion {
    pub name: String,
    pub url: Url,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeersConfig {
    pub regions: Vec<PeerRegion>,
    pub discovery: DiscoveryConfig,
    pub probe_interval_secs: u64,
    pub probe_timeout_ms: u64,
    pub replication_timeout_secs: u64,
}

impl Default for PeersConfig {
    fn default() -> Self {
        Self {
            regions: Vec::new(),
            discovery: Default::default(),
            probe_interval_secs: 60,
            probe_timeout_ms: 1_000,
            replication_timeout_secs: 30,
        }
    }
}

impl PeersConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn replication_timeout(&self) -> Duration {
        Duration::from_secs(self.replication_timeout_secs)
    }
}

fn default_dns_scheme() -> String {
    "http".to_string()
}

fn default_dns_ttl_secs() -> u64 {
    120
}

/// How sibling instances in this region are found.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscoveryConfig {
    Static {
        #[serde(default)]
        peers: Vec<Url>,
    },
    Dns {
        host: String,
        port: u16,
        #[serde(default = "default_dns_scheme")]
        scheme: String,
        #[serde(default)]
        own_addresses: Vec<IpAddr>,
        #[serde(default = "default_dns_ttl_secs")]
        ttl_secs: u64,
    },
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig::Static { peers: Vec::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    pub scheme: String,
    pub token: Option<String>,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            scheme: "Bearer".to_string(),
            token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LeaderConfig {
    Static { is_leader: bool },
}

impl Default for LeaderConfig {
    fn default() -> Self {
        LeaderConfig::Static { is_leader: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckConfig {
    pub enabled: bool,
    pub poll_interval_secs: u64,
    pub max_parallelism: usize,
    /// Repair by deleting inconsistent records. When off, inconsistencies
    /// are only logged.
    pub allow_deletes: bool,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval_secs: 3600,
            max_parallelism: 8,
            allow_deletes: false,
        }
    }
}

impl CheckConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsistencyConfig {
    pub blob_index: CheckConfig,
    pub blob_store: CheckConfig,
    pub ref_store: CheckConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesystemGcConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for FilesystemGcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
        }
    }
}

impl FilesystemGcConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}
