//! This module controls configuration parsing from the end user, providing a
//! convenience mechanism for the rest of the program. Crashes at boot are most
//! likely to originate from this code, intentionally.
//!
//! The configuration lists the nodes to scrape, partitioned by role. Parsing
//! happens in two steps: serde reads the YAML into entries where every field
//! is optional, then [`Config::from_entries`] applies defaults, clamps
//! timeouts and rejects what can't be monitored.

use std::{
    env, fmt, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use rustc_hash::FxHashSet;
use serde::Deserialize;
use tracing::debug;

/// Environment variable that, when set, supplies the configuration contents
/// directly and takes precedence over the configuration file.
pub const CONFIG_ENV_VAR: &str = "REDIS_METRICS_CONFIG";

/// Host used when an entry names none.
pub const DEFAULT_HOST: &str = "localhost";
/// Ceiling applied to every dial and read timeout.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(20);

const DEFAULT_CONNECT_TIMEOUT_MILLISECONDS: u64 = 5_000;
const DEFAULT_READ_TIMEOUT_MILLISECONDS: u64 = 3_000;

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error reading the configuration file.
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<std::io::Error>,
    },
    /// A port outside of 1..=65535.
    #[error("Node {name} has invalid port {port}, must be in 1..=65535")]
    InvalidPort {
        /// Node name as configured, or its default
        name: String,
        /// The rejected port
        port: u32,
    },
    /// Two nodes share a name within one configuration.
    #[error("Duplicate node name found: {0}")]
    DuplicateName(String),
    /// Discovery was requested on a node that is not a sentinel.
    #[error("Node {0} requests discovery but is not a sentinel")]
    DiscoveryOnStandalone(String),
}

/// The role of a monitored node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// A data node, master or replica.
    Standalone,
    /// A sentinel.
    Sentinel,
}

impl Role {
    /// The port the role listens on unless configured otherwise.
    #[must_use]
    pub fn default_port(self) -> u16 {
        match self {
            Role::Standalone => 6379,
            Role::Sentinel => 26379,
        }
    }

    /// Lower case name of the role, used in default node names.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Standalone => "standalone",
            Role::Sentinel => "sentinel",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host and port of a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    /// Host name or IP address.
    pub host: String,
    /// TCP port, never zero.
    pub port: u16,
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Topology discovery requested for a sentinel node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct Discovery {
    /// Enumerate the masters the sentinel monitors.
    pub masters: bool,
    /// Enumerate replicas of monitored masters. Accepted, not implemented.
    pub replicas: bool,
    /// Enumerate peer sentinels. Accepted, not implemented.
    pub sentinels: bool,
}

/// Identity and connection parameters of one monitored node.
#[derive(Clone, PartialEq, Eq)]
pub struct NodeSpec {
    /// Name, unique within one configuration.
    pub name: String,
    /// Where the node listens.
    pub address: Address,
    /// Password sent with `AUTH`, if any.
    pub password: Option<String>,
    /// Limit on establishing the connection.
    pub connect_timeout: Duration,
    /// Limit on waiting for each reply.
    pub read_timeout: Duration,
    /// Standalone or sentinel.
    pub role: Role,
    /// Discovery flags, all false for standalone nodes.
    pub discovery: Discovery,
}

impl fmt::Debug for NodeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSpec")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("role", &self.role)
            .field("discovery", &self.discovery)
            .finish()
    }
}

/// One node as written in the configuration file.
#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "snake_case")]
pub struct Entry {
    /// Name of the node. Defaults to `<role>-<host>:<port>`.
    pub name: Option<String>,
    /// Host of the node. Defaults to `localhost`.
    pub host: Option<String>,
    /// Port of the node. Defaults to the role's standard port.
    pub port: Option<u32>,
    /// Password sent with `AUTH`.
    pub password: Option<String>,
    /// Dial timeout, clamped to 20 seconds.
    pub connect_timeout_milliseconds: Option<u64>,
    /// Read timeout, clamped to 20 seconds.
    pub read_timeout_milliseconds: Option<u64>,
    /// Sentinel only: enumerate monitored masters.
    #[serde(default)]
    pub discover_masters: bool,
    /// Sentinel only: enumerate replicas.
    #[serde(default)]
    pub discover_replicas: bool,
    /// Sentinel only: enumerate peer sentinels.
    #[serde(default)]
    pub discover_sentinels: bool,
}

/// The configuration file as written.
#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "snake_case")]
pub struct Entries {
    /// Data nodes.
    #[serde(default, alias = "redis")]
    pub standalone: Vec<Entry>,
    /// Sentinel nodes.
    #[serde(default)]
    pub sentinel: Vec<Entry>,
}

/// A validated configuration generation.
///
/// Equality is structural: role partition, order within a role and every
/// field of every node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    /// Data nodes, in configured order.
    pub standalone: Vec<NodeSpec>,
    /// Sentinel nodes, in configured order.
    pub sentinel: Vec<NodeSpec>,
}

impl Config {
    /// Parse and validate YAML `contents`.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML does not deserialize or an entry fails
    /// validation.
    pub fn from_yaml(contents: &str) -> Result<Self, Error> {
        let entries: Entries = serde_yaml::from_str(contents)?;
        Self::from_entries(entries)
    }

    /// Apply defaults and validate `entries`.
    ///
    /// # Errors
    ///
    /// Returns an error on an out of range port, on discovery flags for a data
    /// node or on a repeated node name.
    pub fn from_entries(entries: Entries) -> Result<Self, Error> {
        let standalone = entries
            .standalone
            .into_iter()
            .map(|e| node(e, Role::Standalone))
            .collect::<Result<Vec<_>, _>>()?;
        let sentinel = entries
            .sentinel
            .into_iter()
            .map(|e| node(e, Role::Sentinel))
            .collect::<Result<Vec<_>, _>>()?;

        let config = Self {
            standalone,
            sentinel,
        };
        let mut seen = FxHashSet::default();
        for spec in config.nodes() {
            if !seen.insert(spec.name.as_str()) {
                return Err(Error::DuplicateName(spec.name.clone()));
            }
        }
        Ok(config)
    }

    /// All nodes, data nodes first, each role in configured order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeSpec> {
        self.standalone.iter().chain(self.sentinel.iter())
    }

    /// Total number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.standalone.len() + self.sentinel.len()
    }

    /// Whether no node is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn node(entry: Entry, role: Role) -> Result<NodeSpec, Error> {
    let host = entry
        .host
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    // An explicit 0 means "use the default" like an absent port.
    let port = match entry.port {
        None | Some(0) => role.default_port(),
        Some(port) => match u16::try_from(port) {
            Ok(p) if p != 0 => p,
            _ => {
                let name = entry
                    .name
                    .unwrap_or_else(|| format!("{role}-{host}:{port}"));
                return Err(Error::InvalidPort { name, port });
            }
        },
    };
    let address = Address { host, port };
    let name = entry
        .name
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| format!("{role}-{address}"));

    let discovery = Discovery {
        masters: entry.discover_masters,
        replicas: entry.discover_replicas,
        sentinels: entry.discover_sentinels,
    };
    if role == Role::Standalone && discovery != Discovery::default() {
        return Err(Error::DiscoveryOnStandalone(name));
    }

    Ok(NodeSpec {
        name,
        address,
        password: entry.password.filter(|p| !p.is_empty()),
        connect_timeout: clamp_timeout(
            entry
                .connect_timeout_milliseconds
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MILLISECONDS),
        ),
        read_timeout: clamp_timeout(
            entry
                .read_timeout_milliseconds
                .unwrap_or(DEFAULT_READ_TIMEOUT_MILLISECONDS),
        ),
        role,
        discovery,
    })
}

fn clamp_timeout(milliseconds: u64) -> Duration {
    Duration::from_millis(milliseconds).min(MAX_TIMEOUT)
}

/// Where configuration generations come from.
pub trait Source: Send + Sync {
    /// Read and validate the current configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration can't be read or is invalid.
    fn load(&self) -> Result<Config, Error>;

    /// Whether `a` and `b` describe the same set of nodes.
    fn equal(&self, a: &Config, b: &Config) -> bool {
        a == b
    }
}

/// Configuration read from a YAML file, or from [`CONFIG_ENV_VAR`] when set.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    /// Create a source reading `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The configured file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn contents(&self) -> Result<String, Error> {
        if let Ok(contents) = env::var(CONFIG_ENV_VAR) {
            debug!("Using config from env var '{CONFIG_ENV_VAR}'");
            return Ok(contents);
        }
        debug!("Attempting to open configuration file at: {}", self.path.display());
        fs::read_to_string(&self.path).map_err(|source| Error::ReadFile {
            path: self.path.clone(),
            source: Box::new(source),
        })
    }
}

impl Source for FileSource {
    fn load(&self) -> Result<Config, Error> {
        Config::from_yaml(&self.contents()?)
    }
}
