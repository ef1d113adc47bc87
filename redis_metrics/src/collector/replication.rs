//! Replication role, offsets and the state of each connected replica.

use super::{Field, Node, Scalars, Value, gauge};
use crate::{
    registry::{Desc, Family, Kind, Registry},
    report::{Report, parse_fields},
};

const ROLE: Value = Value::Enum(&[("master", 0.0), ("slave", 1.0)], None);
const LINK: Value = Value::Enum(&[("up", 0.0), ("down", 1.0)], None);

pub(crate) const FIELDS: &[Field] = &[
    gauge(
        "role",
        "redis_replication_role",
        "Replication role: master 0, replica 1.",
    )
    .value(ROLE),
    gauge(
        "connected_slaves",
        "redis_replication_connected_slaves",
        "Connected replicas.",
    ),
    gauge(
        "master_repl_offset",
        "redis_replication_master_repl_offset",
        "Current replication offset.",
    ),
    gauge(
        "second_repl_offset",
        "redis_replication_second_repl_offset",
        "Offset up to which the previous replication ID is accepted.",
    ),
    gauge(
        "repl_backlog_active",
        "redis_replication_repl_backlog_active",
        "Whether the replication backlog is active.",
    ),
    gauge(
        "repl_backlog_size",
        "redis_replication_repl_backlog_size",
        "Size of the replication backlog in bytes.",
    ),
    gauge(
        "repl_backlog_first_byte_offset",
        "redis_replication_repl_backlog_first_byte_offset",
        "Master offset of the first backlog byte.",
    ),
    gauge(
        "repl_backlog_histlen",
        "redis_replication_repl_backlog_histlen",
        "Bytes of data in the replication backlog.",
    ),
    gauge(
        "master_link_status",
        "redis_replication_master_link_status",
        "Link to the master: up 0, down 1.",
    )
    .value(LINK),
    gauge(
        "master_last_io_seconds_ago",
        "redis_replication_master_last_io_seconds_ago",
        "Seconds since the last interaction with the master.",
    ),
    gauge(
        "master_sync_in_progress",
        "redis_replication_master_sync_in_progress",
        "Whether the replica is syncing from its master.",
    ),
    gauge(
        "slave_repl_offset",
        "redis_replication_slave_repl_offset",
        "Replication offset of this replica.",
    ),
    gauge(
        "slave_priority",
        "redis_replication_slave_priority",
        "Promotion priority of this replica.",
    ),
    gauge(
        "slave_read_only",
        "redis_replication_slave_read_only",
        "Whether this replica is read only.",
    ),
    gauge(
        "master_sync_left_bytes",
        "redis_replication_master_sync_left_bytes",
        "Bytes left to transfer before the sync completes.",
    ),
    gauge(
        "master_sync_last_io_seconds_ago",
        "redis_replication_master_sync_last_io_seconds_ago",
        "Seconds since the last transfer I/O during a sync.",
    ),
    gauge(
        "master_link_down_since_seconds",
        "redis_replication_master_link_down_since_seconds",
        "Seconds since the link to the master went down.",
    ),
    gauge(
        "min_slaves_good_slaves",
        "redis_replication_min_slaves_good_slaves",
        "Replicas currently considered good.",
    ),
];

const MASTER: Desc = Desc {
    name: "redis_replication_master",
    help: "The master this replica follows, always 1.",
    kind: Kind::Gauge,
    labels: &["node_name", "node_address", "host", "port"],
};

const REPLICA_LABELS: &[&str] = &["node_name", "node_address", "slave_id", "slave_addr"];

const SLAVE_STATE: Desc = Desc {
    name: "redis_replication_slave_state",
    help: "Replica link state: online 0, anything else 1.",
    kind: Kind::Gauge,
    labels: REPLICA_LABELS,
};

const SLAVE_OFFSET: Desc = Desc {
    name: "redis_replication_slave_offset",
    help: "Replication offset acknowledged by the replica.",
    kind: Kind::Gauge,
    labels: REPLICA_LABELS,
};

const SLAVE_LAG: Desc = Desc {
    name: "redis_replication_slave_lag",
    help: "Seconds since the replica last acknowledged.",
    kind: Kind::Gauge,
    labels: REPLICA_LABELS,
};

#[derive(Debug)]
pub(crate) struct Replication {
    scalars: Scalars,
    master: Family,
    slave_state: Family,
    slave_offset: Family,
    slave_lag: Family,
}

impl Replication {
    pub(crate) fn new(registry: &Registry) -> Self {
        Self {
            scalars: Scalars::new(registry, FIELDS),
            master: registry.family(MASTER),
            slave_state: registry.family(SLAVE_STATE),
            slave_offset: registry.family(SLAVE_OFFSET),
            slave_lag: registry.family(SLAVE_LAG),
        }
    }

    pub(crate) fn families(&self) -> Vec<&Family> {
        let mut families = self.scalars.families();
        families.extend([
            &self.master,
            &self.slave_state,
            &self.slave_offset,
            &self.slave_lag,
        ]);
        families
    }

    pub(crate) fn apply(&self, node: &Node, report: &Report) {
        self.scalars.apply(node, report);

        // A failover moves the replica to another master or promotes it, the
        // previous master's series goes either way.
        let identity = [node.name.as_str(), node.address.as_str()];
        match (report.get("master_host"), report.get("master_port")) {
            (Some(host), Some(port)) => self.master.set_only(
                &[identity[0], identity[1], host.trim(), port.trim()],
                identity.len(),
                1.0,
            ),
            _ => self.master.retire(&identity),
        }

        for (key, value) in report {
            if !is_replica_line(key, value) {
                continue;
            }
            let fields = parse_fields(value);
            let (Some(ip), Some(port)) = (fields.get("ip"), fields.get("port")) else {
                continue;
            };
            let addr = format!("{ip}:{port}");
            let labels = [
                node.name.as_str(),
                node.address.as_str(),
                key.as_str(),
                addr.as_str(),
            ];

            if let Some(state) = fields.get("state") {
                let down = if *state == "online" { 0.0 } else { 1.0 };
                self.slave_state.gauge(&labels).set(down);
            }
            if let Some(offset) = fields.get("offset").and_then(|v| v.parse::<f64>().ok()) {
                self.slave_offset.gauge(&labels).set(offset);
            }
            if let Some(lag) = fields.get("lag").and_then(|v| v.parse::<f64>().ok()) {
                self.slave_lag.gauge(&labels).set(lag);
            }
        }
    }
}

/// `slaveN:ip=..,port=..,state=..` lines. Fields such as `slave_priority`
/// share the prefix and are excluded.
fn is_replica_line(key: &str, value: &str) -> bool {
    key.strip_prefix("slave")
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
        && value.contains("state=")
}
