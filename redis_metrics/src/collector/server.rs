//! Server identity and uptime.
//!
//! Build and runtime identity is exported as a single `redis_server_info`
//! series with value 1 whose labels carry the identifying fields. Fields the
//! node does not report are labelled `unknown`, except `redis_mode` which
//! older servers omit and which defaults to `standalone`.

use super::{Field, NODE_LABELS, Node, Scalars, gauge};
use crate::{
    registry::{Desc, Family, Kind, Registry},
    report::Report,
};

const UNKNOWN: &str = "unknown";

/// Report fields copied into labels of `redis_server_info`, in label order,
/// with the value used when the field is absent.
const INFO_FIELDS: [(&str, &str); 13] = [
    ("redis_version", UNKNOWN),
    ("redis_git_sha1", UNKNOWN),
    ("redis_git_dirty", UNKNOWN),
    ("redis_build_id", UNKNOWN),
    ("redis_mode", "standalone"),
    ("os", UNKNOWN),
    ("arch_bits", UNKNOWN),
    ("multiplexing_api", UNKNOWN),
    ("atomicvar_api", UNKNOWN),
    ("gcc_version", UNKNOWN),
    ("tcp_port", UNKNOWN),
    ("executable", UNKNOWN),
    ("config_file", UNKNOWN),
];

const INFO: Desc = Desc {
    name: "redis_server_info",
    help: "Server build and runtime identity, always 1.",
    kind: Kind::Gauge,
    labels: &[
        "node_name",
        "node_address",
        "redis_version",
        "redis_git_sha1",
        "redis_git_dirty",
        "redis_build_id",
        "redis_mode",
        "os",
        "arch_bits",
        "multiplexing_api",
        "atomicvar_api",
        "gcc_version",
        "tcp_port",
        "executable",
        "config_file",
    ],
};

pub(crate) const FIELDS: &[Field] = &[
    gauge(
        "uptime_in_seconds",
        "redis_server_uptime_in_seconds",
        "Seconds since the server started.",
    ),
    gauge(
        "uptime_in_days",
        "redis_server_uptime_in_days",
        "Days since the server started.",
    ),
    gauge("hz", "redis_server_hz", "Current frequency of background tasks."),
    gauge(
        "configured_hz",
        "redis_server_configured_hz",
        "Configured frequency of background tasks.",
    ),
    gauge(
        "lru_clock",
        "redis_server_lru_clock",
        "Clock used for LRU management, in minutes.",
    ),
];

#[derive(Debug)]
pub(crate) struct Server {
    scalars: Scalars,
    info: Family,
}

impl Server {
    pub(crate) fn new(registry: &Registry) -> Self {
        Self {
            scalars: Scalars::new(registry, FIELDS),
            info: registry.family(INFO),
        }
    }

    pub(crate) fn families(&self) -> Vec<&Family> {
        let mut families = self.scalars.families();
        families.push(&self.info);
        families
    }

    pub(crate) fn apply(&self, node: &Node, report: &Report) {
        self.scalars.apply(node, report);

        let mut labels = Vec::with_capacity(INFO.labels.len());
        labels.push(node.name.as_str());
        labels.push(node.address.as_str());
        for (field, default) in INFO_FIELDS {
            let value = report.get(field).map(str::trim).filter(|v| !v.is_empty());
            labels.push(value.unwrap_or(default));
        }
        self.info.set_only(&labels, NODE_LABELS.len(), 1.0);
    }
}
