//! Sentinel state, the masters listed in its `INFO` and the masters returned
//! by `SENTINEL MASTERS`.

use super::{Field, Node, Scalars, Value, gauge, record};
use crate::{
    registry::{Desc, Family, Kind, Registry},
    report::{Report, parse_fields},
};

pub(crate) const FIELDS: &[Field] = &[
    gauge(
        "sentinel_masters",
        "redis_sentinel_sentinel_masters",
        "Masters monitored by the sentinel.",
    ),
    gauge(
        "sentinel_tilt",
        "redis_sentinel_sentinel_tilt",
        "Whether the sentinel is in TILT mode.",
    ),
    gauge(
        "sentinel_running_scripts",
        "redis_sentinel_sentinel_running_scripts",
        "Scripts currently running.",
    ),
    gauge(
        "sentinel_scripts_queue_length",
        "redis_sentinel_sentinel_scripts_queue_length",
        "Scripts queued for execution.",
    ),
    gauge(
        "sentinel_simulate_failure_flags",
        "redis_sentinel_sentinel_simulate_failure_flags",
        "Failure simulation flags.",
    ),
];

const MASTER_LABELS: &[&str] = &["node_name", "node_address", "master_name", "master_address"];

const MASTER_STATUS: Desc = Desc {
    name: "redis_sentinel_master_status",
    help: "Master status as seen by the sentinel: ok 1, anything else 0.",
    kind: Kind::Gauge,
    labels: MASTER_LABELS,
};

const MASTER_SLAVES: Desc = Desc {
    name: "redis_sentinel_master_slaves",
    help: "Replicas of the master known to the sentinel.",
    kind: Kind::Gauge,
    labels: MASTER_LABELS,
};

const MASTER_SENTINELS: Desc = Desc {
    name: "redis_sentinel_master_sentinels",
    help: "Sentinels monitoring the master.",
    kind: Kind::Gauge,
    labels: MASTER_LABELS,
};

#[derive(Debug)]
pub(crate) struct Sentinel {
    scalars: Scalars,
    status: Family,
    slaves: Family,
    sentinels: Family,
}

impl Sentinel {
    pub(crate) fn new(registry: &Registry) -> Self {
        Self {
            scalars: Scalars::new(registry, FIELDS),
            status: registry.family(MASTER_STATUS),
            slaves: registry.family(MASTER_SLAVES),
            sentinels: registry.family(MASTER_SENTINELS),
        }
    }

    pub(crate) fn families(&self) -> Vec<&Family> {
        let mut families = self.scalars.families();
        families.extend([&self.status, &self.slaves, &self.sentinels]);
        families
    }

    pub(crate) fn apply(&self, node: &Node, report: &Report) {
        self.scalars.apply(node, report);

        for (key, value) in report {
            if !is_master_line(key) {
                continue;
            }
            let fields = parse_fields(value);
            let (Some(&name), Some(&address)) = (fields.get("name"), fields.get("address")) else {
                continue;
            };
            let labels = [node.name.as_str(), node.address.as_str(), name, address];

            if let Some(status) = fields.get("status") {
                record(&self.status, &labels, Value::Status("ok"), status);
            }
            if let Some(slaves) = fields.get("slaves") {
                record(&self.slaves, &labels, Value::Number, slaves);
            }
            if let Some(sentinels) = fields.get("sentinels") {
                record(&self.sentinels, &labels, Value::Number, sentinels);
            }
        }
    }
}

fn is_master_line(key: &str) -> bool {
    key.strip_prefix("master")
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

const INFO: Desc = Desc {
    name: "redis_sentinel_masters_info",
    help: "A master returned by SENTINEL MASTERS, always 1.",
    kind: Kind::Gauge,
    labels: &[
        "node_name",
        "node_address",
        "master_name",
        "ip",
        "port",
        "runid",
        "flags",
    ],
};

const ENUMERATED_LABELS: &[&str] = &["node_name", "node_address", "master_name"];

const NUM_SLAVES: Desc = Desc {
    name: "redis_sentinel_masters_num_slaves",
    help: "Replicas of a master returned by SENTINEL MASTERS.",
    kind: Kind::Gauge,
    labels: ENUMERATED_LABELS,
};

const NUM_OTHER_SENTINELS: Desc = Desc {
    name: "redis_sentinel_masters_num_other_sentinels",
    help: "Other sentinels monitoring a master returned by SENTINEL MASTERS.",
    kind: Kind::Gauge,
    labels: ENUMERATED_LABELS,
};

/// Families for sentinel master enumeration.
#[derive(Debug)]
pub(crate) struct Masters {
    info: Family,
    num_slaves: Family,
    num_other_sentinels: Family,
}

impl Masters {
    pub(crate) fn new(registry: &Registry) -> Self {
        Self {
            info: registry.family(INFO),
            num_slaves: registry.family(NUM_SLAVES),
            num_other_sentinels: registry.family(NUM_OTHER_SENTINELS),
        }
    }

    pub(crate) fn families(&self) -> Vec<&Family> {
        vec![&self.info, &self.num_slaves, &self.num_other_sentinels]
    }

    /// Each report holds the field/value pairs of one master.
    pub(crate) fn apply(&self, node: &Node, masters: &[Report]) {
        for master in masters {
            let Some(name) = master.get("name") else {
                continue;
            };
            let field = |f: &str| master.get(f).unwrap_or("unknown");
            // One series per master: a new runid or flags replace the old one.
            self.info.set_only(
                &[
                    node.name.as_str(),
                    node.address.as_str(),
                    name,
                    field("ip"),
                    field("port"),
                    field("runid"),
                    field("flags"),
                ],
                ENUMERATED_LABELS.len(),
                1.0,
            );

            let labels = [node.name.as_str(), node.address.as_str(), name];
            if let Some(raw) = master.get("num-slaves") {
                record(&self.num_slaves, &labels, Value::Number, raw);
            }
            if let Some(raw) = master.get("num-other-sentinels") {
                record(&self.num_other_sentinels, &labels, Value::Number, raw);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{
        Sink,
        tests::{live, sample, sentinel_node},
    };
    use crate::report;

    const NODE: &str = "node_name=\"watcher\",node_address=\"10.0.0.9:26379\"";

    #[test]
    fn master_lines() {
        assert!(is_master_line("master0"));
        assert!(!is_master_line("master_host"));
        assert!(!is_master_line("master"));
    }

    #[test]
    fn sentinel_info() {
        let (collectors, exposition) = live();
        let report = report::parse(
            "# Sentinel\r\n\
             sentinel_masters:2\r\n\
             sentinel_tilt:0\r\n\
             master0:name=mymaster,status=ok,address=10.0.0.1:6379,slaves=2,sentinels=3\r\n\
             master1:name=other,status=odown,address=10.0.0.5:6379,slaves=0,sentinels=3\r\n",
        );
        collectors
            .apply_report(&sentinel_node(), &report)
            .expect("apply failed");

        let get = |series: &str| sample(&exposition, series);
        assert_eq!(
            get(&format!("redis_sentinel_sentinel_masters{{{NODE}}}")).as_deref(),
            Some("2")
        );
        let mymaster = "master_name=\"mymaster\",master_address=\"10.0.0.1:6379\"";
        let other = "master_name=\"other\",master_address=\"10.0.0.5:6379\"";
        assert_eq!(
            get(&format!("redis_sentinel_master_status{{{NODE},{mymaster}}}")).as_deref(),
            Some("1")
        );
        assert_eq!(
            get(&format!("redis_sentinel_master_status{{{NODE},{other}}}")).as_deref(),
            Some("0")
        );
        assert_eq!(
            get(&format!("redis_sentinel_master_slaves{{{NODE},{mymaster}}}")).as_deref(),
            Some("2")
        );
        assert_eq!(
            get(&format!("redis_sentinel_master_sentinels{{{NODE},{other}}}")).as_deref(),
            Some("3")
        );
    }

    #[test]
    fn enumerated_masters() {
        let (collectors, exposition) = live();
        let master: Report = [
            ("name", "mymaster"),
            ("ip", "10.0.0.1"),
            ("port", "6379"),
            ("runid", "abc123"),
            ("flags", "master"),
            ("num-slaves", "2"),
            ("num-other-sentinels", "2"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let nameless = Report::default();

        collectors
            .apply_masters(&sentinel_node(), &[master, nameless])
            .expect("apply failed");

        assert_eq!(
            sample(
                &exposition,
                &format!(
                    "redis_sentinel_masters_info{{{NODE},master_name=\"mymaster\",ip=\"10.0.0.1\",port=\"6379\",runid=\"abc123\",flags=\"master\"}}"
                )
            )
            .as_deref(),
            Some("1")
        );
        assert_eq!(
            sample(
                &exposition,
                &format!("redis_sentinel_masters_num_slaves{{{NODE},master_name=\"mymaster\"}}")
            )
            .as_deref(),
            Some("2")
        );
        assert_eq!(
            exposition
                .render()
                .lines()
                .filter(|l| l.starts_with("redis_sentinel_masters_info{"))
                .count(),
            1
        );
    }

    #[test]
    fn changed_flags_replace_master_series() {
        let (collectors, exposition) = live();
        let master = |flags: &str| -> Report {
            [("name", "mymaster"), ("ip", "10.0.0.1"), ("port", "6379"), ("flags", flags)]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        };
        let node = sentinel_node();

        collectors
            .apply_masters(&node, &[master("master")])
            .expect("apply failed");
        collectors
            .apply_masters(&node, &[master("master,s_down")])
            .expect("apply failed");

        let rendered = exposition.render();
        let info: Vec<&str> = rendered
            .lines()
            .filter(|l| l.starts_with("redis_sentinel_masters_info{"))
            .collect();
        assert_eq!(info.len(), 1);
        assert!(info[0].contains("flags=\"master,s_down\""));
    }
}
