//! Mapping of parsed reports onto metric families.
//!
//! A report is split into sections, [`Section`], each of which owns the
//! families for its fields. Most sections are a flat table of [`Field`]
//! entries; the ones whose lines carry `key=value` lists (keyspace,
//! replicas, command statistics, sentinel masters) add families labelled by
//! what those lists describe. [`Collectors`] bundles every section for one
//! epoch's [`Registry`] and is the [`Sink`] node loops write through.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::{
    config::{NodeSpec, Role},
    registry::{self, Desc, Exposition, Family, Kind, Registry},
    report::Report,
};

mod clients;
mod cluster;
mod commandstats;
mod cpu;
mod keyspace;
mod memory;
mod persistence;
mod replication;
mod sentinel;
mod server;
mod stats;

/// Labels carried by every series.
pub const NODE_LABELS: &[&str] = &["node_name", "node_address"];

/// Errors produced by [`Sink`] implementations
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A write arrived while the collectors' families were not live.
    #[error("Collectors of epoch {0} are not registered")]
    NotRegistered(u64),
    /// Registration with the exposition failed.
    #[error(transparent)]
    Registry(#[from] registry::Error),
}

/// The identity series are labelled with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Configured or default node name.
    pub name: String,
    /// `host:port` of the node.
    pub address: String,
    /// Standalone or sentinel.
    pub role: Role,
}

impl Node {
    fn labels(&self) -> [&str; 2] {
        [self.name.as_str(), self.address.as_str()]
    }
}

impl From<&NodeSpec> for Node {
    fn from(spec: &NodeSpec) -> Self {
        Self {
            name: spec.name.clone(),
            address: spec.address.to_string(),
            role: spec.role,
        }
    }
}

/// Destination of the reports node loops collect.
pub trait Sink: Send + Sync + 'static {
    /// Make every family of this sink live.
    ///
    /// # Errors
    ///
    /// Fails if any family name is already live, in which case none of this
    /// sink's families is.
    fn register_all(&self, exposition: &Exposition) -> Result<(), Error>;

    /// Remove every family of this sink from the live set. Returns false if
    /// any family was not live.
    fn unregister_all(&self, exposition: &Exposition) -> bool;

    /// Take over from `old` in one step: its families leave the live set and
    /// this sink's families enter it, with no render seeing anything in
    /// between.
    ///
    /// # Errors
    ///
    /// Fails if some family of `old` was not live or if this sink's families
    /// can't be registered. Either way `old` is no longer live.
    fn replace(&self, old: &Self, exposition: &Exposition) -> Result<(), Error>;

    /// Record whether the latest probe of `node` succeeded.
    ///
    /// # Errors
    ///
    /// Fails if the sink is not registered.
    fn liveness(&self, node: &Node, up: bool) -> Result<(), Error>;

    /// Record `report` for `node`. A down report records nothing beyond
    /// liveness.
    ///
    /// # Errors
    ///
    /// Fails if the sink is not registered.
    fn apply_report(&self, node: &Node, report: &Report) -> Result<(), Error>;

    /// Record the masters a sentinel reports monitoring, one report per
    /// master.
    ///
    /// # Errors
    ///
    /// Fails if the sink is not registered.
    fn apply_masters(&self, node: &Node, masters: &[Report]) -> Result<(), Error>;
}

/// Sections of an `INFO` report, in the order they are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    /// Version, build and uptime.
    Server,
    /// Client connections.
    Clients,
    /// Memory use and allocator statistics.
    Memory,
    /// RDB and AOF state.
    Persistence,
    /// General statistics.
    Stats,
    /// Role, offsets and replicas.
    Replication,
    /// CPU time.
    Cpu,
    /// Per-command call statistics.
    Commandstats,
    /// Cluster mode.
    Cluster,
    /// Per-database key counts.
    Keyspace,
    /// Sentinel state and monitored masters.
    Sentinel,
}

impl Section {
    /// Every section, in application order.
    pub const ALL: [Section; 11] = [
        Section::Server,
        Section::Clients,
        Section::Memory,
        Section::Persistence,
        Section::Stats,
        Section::Replication,
        Section::Cpu,
        Section::Commandstats,
        Section::Cluster,
        Section::Keyspace,
        Section::Sentinel,
    ];

    /// Lower case section name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Section::Server => "server",
            Section::Clients => "clients",
            Section::Memory => "memory",
            Section::Persistence => "persistence",
            Section::Stats => "stats",
            Section::Replication => "replication",
            Section::Cpu => "cpu",
            Section::Commandstats => "commandstats",
            Section::Cluster => "cluster",
            Section::Keyspace => "keyspace",
            Section::Sentinel => "sentinel",
        }
    }

    /// Whether nodes of `role` report this section.
    #[must_use]
    pub fn applies_to(self, role: Role) -> bool {
        match self {
            Section::Server | Section::Clients | Section::Stats | Section::Cpu => true,
            Section::Sentinel => role == Role::Sentinel,
            Section::Memory
            | Section::Persistence
            | Section::Replication
            | Section::Commandstats
            | Section::Cluster
            | Section::Keyspace => role == Role::Standalone,
        }
    }

    fn collector(self, registry: &Registry) -> Collector {
        match self {
            Section::Server => Collector::Server(server::Server::new(registry)),
            Section::Clients => Collector::Scalars(Scalars::new(registry, clients::FIELDS)),
            Section::Memory => Collector::Memory(memory::Memory::new(registry)),
            Section::Persistence => {
                Collector::Scalars(Scalars::new(registry, persistence::FIELDS))
            }
            Section::Stats => Collector::Scalars(Scalars::new(registry, stats::FIELDS)),
            Section::Replication => {
                Collector::Replication(replication::Replication::new(registry))
            }
            Section::Cpu => Collector::Scalars(Scalars::new(registry, cpu::FIELDS)),
            Section::Commandstats => {
                Collector::Commandstats(commandstats::Commandstats::new(registry))
            }
            Section::Cluster => Collector::Scalars(Scalars::new(registry, cluster::FIELDS)),
            Section::Keyspace => Collector::Keyspace(keyspace::Keyspace::new(registry)),
            Section::Sentinel => Collector::Sentinel(sentinel::Sentinel::new(registry)),
        }
    }
}

/// The families of one section.
#[derive(Debug)]
enum Collector {
    Scalars(Scalars),
    Server(server::Server),
    Memory(memory::Memory),
    Replication(replication::Replication),
    Commandstats(commandstats::Commandstats),
    Keyspace(keyspace::Keyspace),
    Sentinel(sentinel::Sentinel),
}

impl Collector {
    fn families(&self) -> Vec<&Family> {
        match self {
            Collector::Scalars(s) => s.families(),
            Collector::Server(s) => s.families(),
            Collector::Memory(s) => s.families(),
            Collector::Replication(s) => s.families(),
            Collector::Commandstats(s) => s.families(),
            Collector::Keyspace(s) => s.families(),
            Collector::Sentinel(s) => s.families(),
        }
    }

    fn apply(&self, node: &Node, report: &Report) {
        match self {
            Collector::Scalars(s) => s.apply(node, report),
            Collector::Server(s) => s.apply(node, report),
            Collector::Memory(s) => s.apply(node, report),
            Collector::Replication(s) => s.apply(node, report),
            Collector::Commandstats(s) => s.apply(node, report),
            Collector::Keyspace(s) => s.apply(node, report),
            Collector::Sentinel(s) => s.apply(node, report),
        }
    }
}

/// How a raw field value becomes a sample.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Value {
    /// The value is a number.
    Number,
    /// 1 when the value equals the given string, 0 otherwise.
    Status(&'static str),
    /// Known values map to numbers, anything else to the default or, without
    /// one, is skipped.
    Enum(&'static [(&'static str, f64)], Option<f64>),
}

impl Value {
    fn parse(self, raw: &str) -> Option<f64> {
        let raw = raw.trim();
        match self {
            Value::Number => raw.parse().ok(),
            Value::Status(ok) => Some(if raw == ok { 1.0 } else { 0.0 }),
            Value::Enum(known, default) => known
                .iter()
                .find(|(name, _)| *name == raw)
                .map(|(_, v)| *v)
                .or(default),
        }
    }
}

/// One report field exported as one family labelled by node.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Field {
    key: &'static str,
    fallback: Option<&'static str>,
    desc: Desc,
    value: Value,
}

impl Field {
    const fn new(key: &'static str, name: &'static str, help: &'static str, kind: Kind) -> Self {
        Self {
            key,
            fallback: None,
            desc: Desc {
                name,
                help,
                kind,
                labels: NODE_LABELS,
            },
            value: Value::Number,
        }
    }

    /// Read `fallback` when `key` is absent, for fields renamed between
    /// server versions.
    const fn or(mut self, fallback: &'static str) -> Self {
        self.fallback = Some(fallback);
        self
    }

    const fn value(mut self, value: Value) -> Self {
        self.value = value;
        self
    }

    fn raw<'a>(&self, report: &'a Report) -> Option<&'a str> {
        report
            .get(self.key)
            .or_else(|| self.fallback.and_then(|f| report.get(f)))
    }
}

/// Numeric gauge read from `key`.
pub(crate) const fn gauge(key: &'static str, name: &'static str, help: &'static str) -> Field {
    Field::new(key, name, help, Kind::Gauge)
}

/// Monotonic counter read from `key`.
pub(crate) const fn counter(key: &'static str, name: &'static str, help: &'static str) -> Field {
    Field::new(key, name, help, Kind::Counter)
}

/// Write `raw` into the series of `family` selected by `labels`. Values that
/// do not parse are skipped.
pub(crate) fn record(family: &Family, labels: &[&str], value: Value, raw: &str) {
    match family.desc().kind {
        Kind::Gauge => {
            if let Some(v) = value.parse(raw) {
                family.gauge(labels).set(v);
            }
        }
        // Totals are mirrored as reported. A node restart or `CONFIG
        // RESETSTAT` lowers them and so must the series.
        Kind::Counter => {
            if let Ok(v) = raw.trim().parse::<u64>() {
                family.gauge(labels).set(v as f64);
            }
        }
    }
}

/// A table of [`Field`] entries bound to a registry.
#[derive(Debug)]
pub(crate) struct Scalars {
    fields: &'static [Field],
    families: Vec<Family>,
}

impl Scalars {
    pub(crate) fn new(registry: &Registry, fields: &'static [Field]) -> Self {
        Self {
            fields,
            families: fields.iter().map(|f| registry.family(f.desc)).collect(),
        }
    }

    pub(crate) fn families(&self) -> Vec<&Family> {
        self.families.iter().collect()
    }

    pub(crate) fn apply(&self, node: &Node, report: &Report) {
        let labels = node.labels();
        for (field, family) in self.fields.iter().zip(&self.families) {
            if let Some(raw) = field.raw(report) {
                record(family, &labels, field.value, raw);
            }
        }
    }
}

const SERVER_UP: Desc = Desc {
    name: "redis_server_up",
    help: "Whether the latest probe of the node succeeded.",
    kind: Kind::Gauge,
    labels: NODE_LABELS,
};

const SENTINEL_UP: Desc = Desc {
    name: "redis_sentinel_up",
    help: "Whether the latest probe of the sentinel succeeded.",
    kind: Kind::Gauge,
    labels: NODE_LABELS,
};

/// Every section's families for one epoch.
#[derive(Debug)]
pub struct Collectors {
    registry: Registry,
    server_up: Family,
    sentinel_up: Family,
    sections: Vec<(Section, Collector)>,
    masters: sentinel::Masters,
    registered: AtomicBool,
}

impl Collectors {
    /// Build families for every section against `registry`. Nothing is live
    /// until [`Sink::register_all`].
    #[must_use]
    pub fn new(registry: &Registry) -> Self {
        Self {
            registry: registry.clone(),
            server_up: registry.family(SERVER_UP),
            sentinel_up: registry.family(SENTINEL_UP),
            sections: Section::ALL
                .iter()
                .map(|s| (*s, s.collector(registry)))
                .collect(),
            masters: sentinel::Masters::new(registry),
            registered: AtomicBool::new(false),
        }
    }

    /// The registry these collectors write to.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn families(&self) -> Vec<&Family> {
        let mut families = vec![&self.server_up, &self.sentinel_up];
        for (_, collector) in &self.sections {
            families.extend(collector.families());
        }
        families.extend(self.masters.families());
        families
    }

    fn ensure_registered(&self) -> Result<(), Error> {
        if self.registered.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::NotRegistered(self.registry.epoch()))
        }
    }
}

impl Sink for Collectors {
    fn register_all(&self, exposition: &Exposition) -> Result<(), Error> {
        exposition.register(&self.families())?;
        self.registered.store(true, Ordering::Release);
        Ok(())
    }

    fn unregister_all(&self, exposition: &Exposition) -> bool {
        self.registered.store(false, Ordering::Release);
        exposition.unregister(&self.families())
    }

    fn replace(&self, old: &Self, exposition: &Exposition) -> Result<(), Error> {
        old.registered.store(false, Ordering::Release);
        exposition.swap(&old.families(), &self.families())?;
        self.registered.store(true, Ordering::Release);
        Ok(())
    }

    fn liveness(&self, node: &Node, up: bool) -> Result<(), Error> {
        self.ensure_registered()?;
        let family = match node.role {
            Role::Standalone => &self.server_up,
            Role::Sentinel => &self.sentinel_up,
        };
        family
            .gauge(&node.labels())
            .set(if up { 1.0 } else { 0.0 });
        Ok(())
    }

    fn apply_report(&self, node: &Node, report: &Report) -> Result<(), Error> {
        self.ensure_registered()?;
        if report.is_down() {
            return Ok(());
        }
        for (section, collector) in &self.sections {
            if section.applies_to(node.role) {
                collector.apply(node, report);
            }
        }
        Ok(())
    }

    fn apply_masters(&self, node: &Node, masters: &[Report]) -> Result<(), Error> {
        self.ensure_registered()?;
        self.masters.apply(node, masters);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use rustc_hash::FxHashSet;

    use super::*;
    use crate::report;

    pub(crate) fn standalone() -> Node {
        Node {
            name: "cache".into(),
            address: "10.0.0.1:6379".into(),
            role: Role::Standalone,
        }
    }

    pub(crate) fn sentinel_node() -> Node {
        Node {
            name: "watcher".into(),
            address: "10.0.0.9:26379".into(),
            role: Role::Sentinel,
        }
    }

    /// Registered collectors for a fresh registry, with their exposition.
    pub(crate) fn live() -> (Collectors, Exposition) {
        let exposition = Exposition::new();
        let collectors = Collectors::new(&Registry::new(1));
        collectors
            .register_all(&exposition)
            .expect("registration failed");
        (collectors, exposition)
    }

    /// The rendered sample line for `series`, e.g.
    /// `redis_server_up{node_name="cache",node_address="10.0.0.1:6379"}`.
    pub(crate) fn sample(exposition: &Exposition, series: &str) -> Option<String> {
        exposition
            .render()
            .lines()
            .find_map(|l| l.strip_prefix(series)?.strip_prefix(' ').map(str::to_string))
    }

    pub(crate) const NODE: &str = "node_name=\"cache\",node_address=\"10.0.0.1:6379\"";

    #[test]
    fn family_names_are_unique() {
        let collectors = Collectors::new(&Registry::new(1));
        let mut seen = FxHashSet::default();
        for family in collectors.families() {
            assert!(
                seen.insert(family.desc().name),
                "duplicate family {}",
                family.desc().name
            );
        }
    }

    #[test]
    fn writes_before_registration_are_refused() {
        let collectors = Collectors::new(&Registry::new(3));
        let node = standalone();
        assert_eq!(
            collectors.apply_report(&node, &Report::default()),
            Err(Error::NotRegistered(3))
        );
        assert_eq!(collectors.liveness(&node, true), Err(Error::NotRegistered(3)));
    }

    #[test]
    fn register_unregister_register_again() {
        let exposition = Exposition::new();
        let old = Collectors::new(&Registry::new(1));
        old.register_all(&exposition).expect("registration failed");

        let new = Collectors::new(&Registry::new(2));
        assert!(matches!(
            new.register_all(&exposition),
            Err(Error::Registry(registry::Error::Duplicate(_)))
        ));
        // The failed attempt must not have removed the old epoch's families.
        assert_eq!(exposition.live_epoch(), Some(1));
        assert_eq!(exposition.len(), old.families().len());

        assert!(old.unregister_all(&exposition));
        assert!(exposition.is_empty());
        new.register_all(&exposition).expect("re-registration failed");
        assert_eq!(exposition.live_epoch(), Some(2));

        let node = standalone();
        assert_eq!(
            old.apply_report(&node, &Report::default()),
            Err(Error::NotRegistered(1))
        );
        assert!(!old.unregister_all(&exposition));
    }

    #[test]
    fn replace_hands_over_every_family() {
        let exposition = Exposition::new();
        let old = Collectors::new(&Registry::new(1));
        old.register_all(&exposition).expect("registration failed");

        let new = Collectors::new(&Registry::new(2));
        new.replace(&old, &exposition).expect("replace failed");
        assert_eq!(exposition.live_epoch(), Some(2));
        assert_eq!(exposition.len(), new.families().len());

        let node = standalone();
        assert_eq!(old.liveness(&node, true), Err(Error::NotRegistered(1)));
        new.liveness(&node, true).expect("liveness failed");

        // The old epoch is gone, a second hand over from it must fail.
        let third = Collectors::new(&Registry::new(3));
        assert!(matches!(
            third.replace(&old, &exposition),
            Err(Error::Registry(registry::Error::NotLive(_)))
        ));
    }

    #[test]
    fn totals_follow_a_reset() {
        let (collectors, exposition) = live();
        let node = standalone();
        collectors
            .apply_report(
                &node,
                &report::parse("total_commands_processed:1000\r\ncmdstat_get:calls=50,usec=500\r\n"),
            )
            .expect("apply failed");
        collectors
            .apply_report(
                &node,
                &report::parse("total_commands_processed:5\r\ncmdstat_get:calls=1,usec=10\r\n"),
            )
            .expect("apply failed");

        assert_eq!(
            sample(
                &exposition,
                &format!("redis_stats_total_commands_processed{{{NODE}}}")
            )
            .as_deref(),
            Some("5")
        );
        assert_eq!(
            sample(
                &exposition,
                &format!("redis_commandstats_calls{{{NODE},cmd=\"get\"}}")
            )
            .as_deref(),
            Some("1")
        );
    }

    #[test]
    fn liveness_per_role() {
        let (collectors, exposition) = live();
        collectors
            .liveness(&standalone(), false)
            .expect("liveness failed");
        collectors
            .liveness(&sentinel_node(), true)
            .expect("liveness failed");

        assert_eq!(
            sample(&exposition, &format!("redis_server_up{{{NODE}}}")).as_deref(),
            Some("0")
        );
        assert_eq!(
            sample(
                &exposition,
                "redis_sentinel_up{node_name=\"watcher\",node_address=\"10.0.0.9:26379\"}"
            )
            .as_deref(),
            Some("1")
        );
    }

    #[test]
    fn down_report_records_nothing() {
        let (collectors, exposition) = live();
        collectors
            .apply_report(&standalone(), &Report::down())
            .expect("apply failed");
        assert_eq!(exposition.render(), "");
    }

    #[test]
    fn malformed_values_are_skipped() {
        let (collectors, exposition) = live();
        let report = report::parse("connected_clients:many\r\nblocked_clients:2\r\n");
        collectors
            .apply_report(&standalone(), &report)
            .expect("apply failed");
        assert_eq!(
            sample(
                &exposition,
                &format!("redis_clients_connected_clients{{{NODE}}}")
            ),
            None
        );
        assert_eq!(
            sample(&exposition, &format!("redis_clients_blocked_clients{{{NODE}}}")).as_deref(),
            Some("2")
        );
    }

    #[test]
    fn sections_follow_role() {
        let (collectors, exposition) = live();
        let report = report::parse("used_memory:1024\r\nconnected_clients:4\r\n");
        collectors
            .apply_report(&sentinel_node(), &report)
            .expect("apply failed");
        let rendered = exposition.render();
        assert!(rendered.contains("redis_clients_connected_clients"));
        assert!(!rendered.contains("redis_memory_used_memory"));
    }

    #[test]
    fn value_kinds() {
        assert_eq!(Value::Number.parse(" 1.5 "), Some(1.5));
        assert_eq!(Value::Number.parse("x"), None);
        assert_eq!(Value::Status("ok").parse("ok"), Some(1.0));
        assert_eq!(Value::Status("ok").parse("err"), Some(0.0));
        let roles = Value::Enum(&[("master", 0.0), ("slave", 1.0)], Some(-1.0));
        assert_eq!(roles.parse("slave"), Some(1.0));
        assert_eq!(roles.parse("sentinel"), Some(-1.0));
        let strict = Value::Enum(&[("master", 0.0)], None);
        assert_eq!(strict.parse("sentinel"), None);
    }
}
