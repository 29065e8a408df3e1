use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::reference::DOCKER_REGISTRY;

pub const DOCKER_REGISTRY_DNS: &str = "registry-1.docker.io";

/// Default chunk size for chunked blob uploads (1 MiB).
pub const DEFAULT_BLOB_CHUNK: u64 = 1 << 20;
/// Default ceiling for monolithic blob uploads (1 GiB); larger blobs are
/// sent chunked.
pub const DEFAULT_BLOB_MAX: i64 = 1 << 30;

/// TLS behavior for a host. Round-trips through the textual names
/// `""`/`enabled`/`insecure`/`disabled` in JSON and plain text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TlsMode {
    #[default]
    Undefined,
    Enabled,
    Insecure,
    Disabled,
}

impl TlsMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsMode::Undefined => "",
            TlsMode::Enabled => "enabled",
            TlsMode::Insecure => "insecure",
            TlsMode::Disabled => "disabled",
        }
    }
}

impl std::str::FromStr for TlsMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" => Ok(TlsMode::Undefined),
            "enabled" => Ok(TlsMode::Enabled),
            "insecure" => Ok(TlsMode::Insecure),
            "disabled" => Ok(TlsMode::Disabled),
            _ => Err(Error::ParsingFailed(format!("unknown tls mode {:?}", s))),
        }
    }
}

impl std::fmt::Display for TlsMode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<String> for TlsMode {
    type Error = Error;
    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<TlsMode> for String {
    fn from(t: TlsMode) -> String {
        t.as_str().to_string()
    }
}

/// Connection parameters for one registry host. Zero values mean "unset"
/// and lose to non-zero values on merge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HostConfig {
    #[serde(skip)]
    pub name: String,
    pub tls: TlsMode,
    pub hostname: String,
    pub path_prefix: String,
    pub mirrors: Vec<String>,
    pub priority: u32,
    pub user: String,
    pub pass: String,
    pub token: String,
    pub blob_chunk: u64,
    pub blob_max: i64,
    pub api: String,
    pub api_opts: BTreeMap<String, String>,
}

impl HostConfig {
    /// Defaults for a host referenced for the first time: https with TLS
    /// verification, DNS name equal to the host name.
    pub fn new(name: &str) -> HostConfig {
        let hostname = if name == DOCKER_REGISTRY {
            DOCKER_REGISTRY_DNS.to_string()
        } else {
            name.to_string()
        };
        HostConfig {
            name: name.to_string(),
            tls: TlsMode::Enabled,
            hostname,
            ..Default::default()
        }
    }

    pub fn scheme(&self) -> &'static str {
        if self.tls == TlsMode::Disabled {
            "http"
        } else {
            "https"
        }
    }

    pub fn effective_blob_chunk(&self) -> u64 {
        if self.blob_chunk == 0 {
            DEFAULT_BLOB_CHUNK
        } else {
            self.blob_chunk
        }
    }

    /// Largest blob sent with a single monolithic put. Zero falls back to
    /// the default; negative disables monolithic puts entirely.
    pub fn effective_blob_max(&self) -> i64 {
        if self.blob_max == 0 {
            DEFAULT_BLOB_MAX
        } else {
            self.blob_max
        }
    }

    /// Field-wise merge: a non-zero incoming value wins, with a warning
    /// when it overrides a differing non-zero value already present.
    pub fn merge(&mut self, new: &HostConfig) {
        fn take<T: PartialEq + Clone + std::fmt::Debug>(
            host: &str,
            field: &str,
            cur: &mut T,
            new: &T,
            zero: T,
        ) {
            if *new == zero || new == cur {
                return;
            }
            if *cur != zero {
                warn!("host {}: overriding {} {:?} with {:?}", host, field, cur, new);
            }
            *cur = new.clone();
        }
        let host = self.name.clone();
        take(&host, "tls", &mut self.tls, &new.tls, TlsMode::Undefined);
        take(&host, "hostname", &mut self.hostname, &new.hostname, String::new());
        take(&host, "pathPrefix", &mut self.path_prefix, &new.path_prefix, String::new());
        take(&host, "mirrors", &mut self.mirrors, &new.mirrors, Vec::new());
        take(&host, "priority", &mut self.priority, &new.priority, 0);
        take(&host, "user", &mut self.user, &new.user, String::new());
        take(&host, "pass", &mut self.pass, &new.pass, String::new());
        take(&host, "token", &mut self.token, &new.token, String::new());
        take(&host, "blobChunk", &mut self.blob_chunk, &new.blob_chunk, 0);
        take(&host, "blobMax", &mut self.blob_max, &new.blob_max, 0);
        take(&host, "api", &mut self.api, &new.api, String::new());
        take(&host, "apiOpts", &mut self.api_opts, &new.api_opts, BTreeMap::new());
    }
}

/// On-disk shape of the host configuration document.
#[derive(Debug, Default, Serialize, Deserialize)]
struct HostsDoc {
    #[serde(default)]
    hosts: HashMap<String, HostConfig>,
}

/// Process-wide host name -> config map. Reads are concurrent; writes only
/// happen at initialization and explicit set/merge. Hosts referenced for
/// the first time are created with defaults.
#[derive(Debug)]
pub struct HostMap {
    hosts: RwLock<HashMap<String, HostConfig>>,
}

impl HostMap {
    pub fn new() -> HostMap {
        let mut hosts = HashMap::new();
        hosts.insert(
            DOCKER_REGISTRY.to_string(),
            HostConfig::new(DOCKER_REGISTRY),
        );
        HostMap {
            hosts: RwLock::new(hosts),
        }
    }

    /// Snapshot of the config for `name`, creating the implicit default
    /// entry on first reference.
    pub fn get(&self, name: &str) -> HostConfig {
        if let Some(cfg) = self.hosts.read().unwrap().get(name) {
            return cfg.clone();
        }
        let mut hosts = self.hosts.write().unwrap();
        hosts
            .entry(name.to_string())
            .or_insert_with(|| HostConfig::new(name))
            .clone()
    }

    pub fn set(&self, mut cfg: HostConfig) -> Result<()> {
        if cfg.name.is_empty() {
            return Err(Error::MissingName("host config has no name".into()));
        }
        if cfg.hostname.is_empty() {
            cfg.hostname = HostConfig::new(&cfg.name).hostname;
        }
        self.hosts.write().unwrap().insert(cfg.name.clone(), cfg);
        Ok(())
    }

    /// Merge `cfg` into the existing entry for its name (implicitly
    /// creating one).
    pub fn merge(&self, cfg: HostConfig) -> Result<()> {
        if cfg.name.is_empty() {
            return Err(Error::MissingName("host config has no name".into()));
        }
        let mut hosts = self.hosts.write().unwrap();
        let entry = hosts
            .entry(cfg.name.clone())
            .or_insert_with(|| HostConfig::new(&cfg.name));
        entry.merge(&cfg);
        Ok(())
    }

    /// Load a `{"hosts": {...}}` JSON document, merging each entry.
    pub fn load_json(&self, data: &str) -> Result<()> {
        let doc: HostsDoc = serde_json::from_str(data)?;
        for (name, mut cfg) in doc.hosts {
            cfg.name = name;
            self.merge(cfg)?;
        }
        Ok(())
    }
}

impl Default for HostMap {
    fn default() -> Self {
        Self::new()
    }
}
