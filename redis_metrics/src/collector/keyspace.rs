//! Per-database key counts from `dbN:keys=..,expires=..,avg_ttl=..` lines.

use super::{Node, Value, record};
use crate::{
    registry::{Desc, Family, Kind, Registry},
    report::{Report, parse_fields},
};

const LABELS: &[&str] = &["node_name", "node_address", "database"];

const KEYS: Desc = Desc {
    name: "redis_keyspace_keys",
    help: "Keys in the database.",
    kind: Kind::Gauge,
    labels: LABELS,
};

const EXPIRES: Desc = Desc {
    name: "redis_keyspace_expires",
    help: "Keys with an expiration in the database.",
    kind: Kind::Gauge,
    labels: LABELS,
};

const AVG_TTL: Desc = Desc {
    name: "redis_keyspace_avg_ttl",
    help: "Estimated average TTL of expiring keys in milliseconds.",
    kind: Kind::Gauge,
    labels: LABELS,
};

#[derive(Debug)]
pub(crate) struct Keyspace {
    keys: Family,
    expires: Family,
    avg_ttl: Family,
}

impl Keyspace {
    pub(crate) fn new(registry: &Registry) -> Self {
        Self {
            keys: registry.family(KEYS),
            expires: registry.family(EXPIRES),
            avg_ttl: registry.family(AVG_TTL),
        }
    }

    pub(crate) fn families(&self) -> Vec<&Family> {
        vec![&self.keys, &self.expires, &self.avg_ttl]
    }

    pub(crate) fn apply(&self, node: &Node, report: &Report) {
        for (key, value) in report {
            if !is_database(key) {
                continue;
            }
            let fields = parse_fields(value);
            if !fields.contains_key("keys") {
                continue;
            }
            let labels = [node.name.as_str(), node.address.as_str(), key.as_str()];
            for (field, family) in [
                ("keys", &self.keys),
                ("expires", &self.expires),
                ("avg_ttl", &self.avg_ttl),
            ] {
                if let Some(raw) = fields.get(field) {
                    record(family, &labels, Value::Number, raw);
                }
            }
        }
    }
}

fn is_database(key: &str) -> bool {
    key.strip_prefix("db")
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{
        Sink,
        tests::{NODE, live, sample, standalone},
    };
    use crate::report;

    #[test]
    fn database_keys() {
        assert!(is_database("db0"));
        assert!(is_database("db15"));
        assert!(!is_database("db"));
        assert!(!is_database("dbfilename"));
    }

    #[test]
    fn per_database_series() {
        let (collectors, exposition) = live();
        let report = report::parse(
            "# Keyspace\r\ndb0:keys=5266,expires=5213,avg_ttl=1345519\r\ndb3:keys=1,expires=0,avg_ttl=0\r\ndb9:garbage\r\n",
        );
        collectors
            .apply_report(&standalone(), &report)
            .expect("apply failed");

        let get = |name: &str, db: &str| {
            sample(&exposition, &format!("{name}{{{NODE},database=\"{db}\"}}"))
        };
        assert_eq!(get("redis_keyspace_keys", "db0").as_deref(), Some("5266"));
        assert_eq!(get("redis_keyspace_expires", "db0").as_deref(), Some("5213"));
        assert_eq!(get("redis_keyspace_avg_ttl", "db0").as_deref(), Some("1345519"));
        assert_eq!(get("redis_keyspace_keys", "db3").as_deref(), Some("1"));
        assert_eq!(get("redis_keyspace_keys", "db9"), None);
    }
}
