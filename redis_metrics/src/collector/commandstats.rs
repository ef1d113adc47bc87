//! Per-command statistics from `cmdstat_<command>:calls=..,usec=..` lines.

use super::{Node, Value, record};
use crate::{
    registry::{Desc, Family, Kind, Registry},
    report::{Report, parse_fields},
};

const PREFIX: &str = "cmdstat_";
const LABELS: &[&str] = &["node_name", "node_address", "cmd"];

const CALLS: Desc = Desc {
    name: "redis_commandstats_calls",
    help: "Calls of the command.",
    kind: Kind::Counter,
    labels: LABELS,
};

const USEC: Desc = Desc {
    name: "redis_commandstats_usec",
    help: "Total CPU microseconds spent in the command.",
    kind: Kind::Counter,
    labels: LABELS,
};

const USEC_PER_CALL: Desc = Desc {
    name: "redis_commandstats_usec_per_call",
    help: "Average CPU microseconds per call of the command.",
    kind: Kind::Gauge,
    labels: LABELS,
};

#[derive(Debug)]
pub(crate) struct Commandstats {
    calls: Family,
    usec: Family,
    usec_per_call: Family,
}

impl Commandstats {
    pub(crate) fn new(registry: &Registry) -> Self {
        Self {
            calls: registry.family(CALLS),
            usec: registry.family(USEC),
            usec_per_call: registry.family(USEC_PER_CALL),
        }
    }

    pub(crate) fn families(&self) -> Vec<&Family> {
        vec![&self.calls, &self.usec, &self.usec_per_call]
    }

    pub(crate) fn apply(&self, node: &Node, report: &Report) {
        for (key, value) in report {
            let Some(cmd) = key.strip_prefix(PREFIX).filter(|c| !c.is_empty()) else {
                continue;
            };
            let fields = parse_fields(value);
            let labels = [node.name.as_str(), node.address.as_str(), cmd];
            for (field, family) in [
                ("calls", &self.calls),
                ("usec", &self.usec),
                ("usec_per_call", &self.usec_per_call),
            ] {
                if let Some(raw) = fields.get(field) {
                    record(family, &labels, Value::Number, raw);
                }
            }
        }
    }
}
