//! Metric storage for scrape epochs and the exposition point that reads it.
//!
//! Every scrape epoch owns one [`Registry`]. Collectors create [`Family`]
//! handles against it at construction time and node loops write through
//! those handles concurrently. The atomic storage of `metrics-util` makes each
//! write a single label-keyed atomic update, no further locking is needed.
//! Every series stores the value it was last set to, counters included: a
//! total read from a report is mirrored, never accumulated.
//!
//! The [`Exposition`] is process wide and outlives every epoch. It holds the
//! set of families that are currently live and renders them in the Prometheus
//! text format. A family name can be live at most once. Families enter and
//! leave the live set in whole batches under one lock, and
//! [`Exposition::swap`] replaces one epoch's batch with the next one's, so a
//! render never observes a partial or empty epoch.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, atomic::Ordering},
};

use metrics::{Gauge, Key, Label};
use metrics_exporter_prometheus::formatting;
use metrics_util::registry::{AtomicStorage, Registry as Store};
use rustc_hash::FxHashMap;

/// Errors produced by [`Exposition`]
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A family with this name is already live.
    #[error("Metric family {0} is already registered")]
    Duplicate(&'static str),
    /// A family expected to be live was not, or belonged to another registry.
    #[error("Metric family {0} is not registered")]
    NotLive(&'static str),
}

/// The kind of a metric family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// A value that can go up and down.
    Gauge,
    /// A running total. It drops only when the node resets it, which
    /// Prometheus reads as a counter reset.
    Counter,
}

impl Kind {
    fn as_str(self) -> &'static str {
        match self {
            Kind::Gauge => "gauge",
            Kind::Counter => "counter",
        }
    }
}

/// Static description of a metric family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Desc {
    /// Fully qualified family name, for example `redis_memory_used_memory`.
    pub name: &'static str,
    /// Help text rendered with the family.
    pub help: &'static str,
    /// Gauge or counter.
    pub kind: Kind,
    /// Label names, in the order values are passed to [`Family::gauge`].
    pub labels: &'static [&'static str],
}

/// Metric storage for a single scrape epoch.
///
/// Cloning is cheap and clones share storage. Two registries are the same
/// registry when [`Registry::ptr_eq`] holds.
#[derive(Clone)]
pub struct Registry {
    epoch: u64,
    store: Arc<Store<Key, AtomicStorage>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// Create empty storage for `epoch`.
    #[must_use]
    pub fn new(epoch: u64) -> Self {
        Self {
            epoch,
            store: Arc::new(Store::new(AtomicStorage)),
        }
    }

    /// The epoch this registry was created for.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Whether `self` and `other` share storage.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.store, &other.store)
    }

    /// Bind `desc` to this registry.
    #[must_use]
    pub fn family(&self, desc: Desc) -> Family {
        Family {
            desc,
            registry: self.clone(),
        }
    }

    /// Series by family name, each as its rendered labels and value.
    fn snapshot(&self) -> FxHashMap<String, Vec<Sample>> {
        let mut snapshot: FxHashMap<String, Vec<Sample>> = FxHashMap::default();
        self.store.visit_gauges(|key, gauge| {
            let value = f64::from_bits(gauge.load(Ordering::Acquire));
            let (_, labels) = formatting::key_to_parts(key, None);
            snapshot
                .entry(key.name().to_string())
                .or_default()
                .push((labels, value));
        });
        snapshot
    }
}

type Sample = (Vec<String>, f64);

/// A metric family bound to the [`Registry`] that stores its series.
#[derive(Debug, Clone)]
pub struct Family {
    desc: Desc,
    registry: Registry,
}

impl Family {
    /// The static description of this family.
    #[must_use]
    pub fn desc(&self) -> &Desc {
        &self.desc
    }

    /// The registry storing this family's series.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Handle for the series with the given label values. Setting it stores
    /// the value as is, whatever the family's kind.
    #[must_use]
    pub fn gauge(&self, values: &[&str]) -> Gauge {
        let key = self.key(values);
        self.registry
            .store
            .get_or_create_gauge(&key, |g| Gauge::from_arc(Arc::clone(g)))
    }

    /// Set the series for `values` and remove every other series of this
    /// family whose first `identity` label values equal those of `values`.
    ///
    /// Info style families carry changing attributes as labels. This keeps a
    /// single series per identity when an attribute changes.
    pub fn set_only(&self, values: &[&str], identity: usize, value: f64) {
        let key = self.key(values);
        self.registry
            .store
            .get_or_create_gauge(&key, |g| Gauge::from_arc(Arc::clone(g)))
            .set(value);
        let identity = &values[..identity.min(values.len())];
        self.registry.store.retain_gauges(|k, _| {
            k == &key || !self.owns(k) || !has_prefix(k, identity)
        });
    }

    /// Remove every series of this family whose leading label values are
    /// `identity`.
    pub fn retire(&self, identity: &[&str]) {
        self.registry
            .store
            .retain_gauges(|k, _| !self.owns(k) || !has_prefix(k, identity));
    }

    fn owns(&self, key: &Key) -> bool {
        key.name() == self.desc.name
    }

    fn key(&self, values: &[&str]) -> Key {
        debug_assert_eq!(
            values.len(),
            self.desc.labels.len(),
            "label arity mismatch for {}",
            self.desc.name
        );
        let labels: Vec<Label> = self
            .desc
            .labels
            .iter()
            .zip(values)
            .map(|(name, value)| Label::new(*name, (*value).to_string()))
            .collect();
        Key::from_parts(self.desc.name, labels)
    }
}

fn has_prefix(key: &Key, values: &[&str]) -> bool {
    let mut labels = key.labels();
    values
        .iter()
        .all(|v| labels.next().is_some_and(|l| l.value() == *v))
}

type Live = BTreeMap<&'static str, Family>;

/// The process wide set of live metric families.
#[derive(Debug, Default)]
pub struct Exposition {
    families: Mutex<Live>,
}

impl Exposition {
    /// Create an exposition with no live families.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Live> {
        self.families.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every family of `batch` live, or none of them.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Duplicate`] if a family with the same name as one in
    /// `batch` is already live, whichever registry it belongs to, or if
    /// `batch` names a family twice.
    pub fn register(&self, batch: &[&Family]) -> Result<(), Error> {
        insert_all(&mut self.lock(), batch)
    }

    /// Remove the families of `batch` from the live set. Returns false unless
    /// every one of them, same name and same registry, was live. Those that
    /// were live are removed regardless.
    pub fn unregister(&self, batch: &[&Family]) -> bool {
        remove_all(&mut self.lock(), batch).is_ok()
    }

    /// Replace the live families of `old` with those of `new` in a single
    /// step. A render sees either all of `old` or all of `new`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotLive`] if some family of `old` was not live and
    /// [`Error::Duplicate`] if `new` collides with a family that stays live.
    /// On error the families of `old` are removed and none of `new` is live.
    pub fn swap(&self, old: &[&Family], new: &[&Family]) -> Result<(), Error> {
        let mut families = self.lock();
        remove_all(&mut families, old)?;
        insert_all(&mut families, new)
    }

    /// The epoch owning the live families, if any are live.
    #[must_use]
    pub fn live_epoch(&self) -> Option<u64> {
        self.lock().values().next().map(|f| f.registry.epoch)
    }

    /// Number of live families.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no family is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Render every live family in the Prometheus text format, version
    /// 0.0.4. Families without series are omitted.
    #[must_use]
    pub fn render(&self) -> String {
        let families = self.lock();

        let mut snapshots: Vec<(&Registry, FxHashMap<String, Vec<Sample>>)> = Vec::new();
        for family in families.values() {
            if !snapshots.iter().any(|(r, _)| r.ptr_eq(&family.registry)) {
                snapshots.push((&family.registry, family.registry.snapshot()));
            }
        }

        let mut out = String::with_capacity(16 * 1024);
        for family in families.values() {
            let Some((_, snapshot)) = snapshots.iter().find(|(r, _)| r.ptr_eq(&family.registry))
            else {
                continue;
            };
            let desc = &family.desc;
            let Some(samples) = snapshot.get(desc.name).filter(|s| !s.is_empty()) else {
                continue;
            };

            formatting::write_help_line(&mut out, desc.name, desc.help);
            formatting::write_type_line(&mut out, desc.name, desc.kind.as_str());
            let mut samples: Vec<&Sample> = samples.iter().collect();
            samples.sort_by(|a, b| a.0.cmp(&b.0));
            for (labels, value) in samples {
                formatting::write_metric_line::<&str, f64>(
                    &mut out, desc.name, None, labels, None, *value,
                );
            }
        }
        out
    }
}

fn insert_all(families: &mut Live, batch: &[&Family]) -> Result<(), Error> {
    for (i, family) in batch.iter().enumerate() {
        let name = family.desc.name;
        if families.contains_key(name) || batch[..i].iter().any(|f| f.desc.name == name) {
            return Err(Error::Duplicate(name));
        }
    }
    for family in batch {
        families.insert(family.desc.name, (*family).clone());
    }
    Ok(())
}

fn remove_all(families: &mut Live, batch: &[&Family]) -> Result<(), Error> {
    let mut missing = None;
    for family in batch {
        let name = family.desc.name;
        match families.get(name) {
            Some(live) if live.registry.ptr_eq(&family.registry) => {
                families.remove(name);
            }
            _ => missing = missing.or(Some(name)),
        }
    }
    missing.map_or(Ok(()), |name| Err(Error::NotLive(name)))
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize},
        thread,
    };

    use super::*;

    const UP: Desc = Desc {
        name: "redis_server_up",
        help: "Whether the last probe succeeded",
        kind: Kind::Gauge,
        labels: &["node_name", "node_address"],
    };

    const CALLS: Desc = Desc {
        name: "redis_commandstats_calls",
        help: "Calls per command",
        kind: Kind::Counter,
        labels: &["node_name", "node_address", "cmd"],
    };

    const MASTER: Desc = Desc {
        name: "redis_replication_master",
        help: "The master followed",
        kind: Kind::Gauge,
        labels: &["node_name", "node_address", "host", "port"],
    };

    #[test]
    fn duplicate_family_is_rejected() {
        let exposition = Exposition::new();
        let first = Registry::new(1).family(UP);
        let second = Registry::new(2).family(UP);

        exposition.register(&[&first]).expect("first registration failed");
        assert_eq!(
            exposition.register(&[&second]),
            Err(Error::Duplicate("redis_server_up"))
        );
        assert_eq!(exposition.live_epoch(), Some(1));
    }

    #[test]
    fn batch_registration_is_all_or_nothing() {
        let exposition = Exposition::new();
        let live = Registry::new(1).family(CALLS);
        exposition.register(&[&live]).expect("registration failed");

        let registry = Registry::new(2);
        let up = registry.family(UP);
        let calls = registry.family(CALLS);
        assert_eq!(
            exposition.register(&[&up, &calls]),
            Err(Error::Duplicate("redis_commandstats_calls"))
        );
        assert_eq!(exposition.len(), 1);
        assert_eq!(exposition.live_epoch(), Some(1));

        let again = Registry::new(3).family(UP);
        assert_eq!(
            exposition.register(&[&again, &again]),
            Err(Error::Duplicate("redis_server_up"))
        );
        assert_eq!(exposition.len(), 1);
    }

    #[test]
    fn reregister_after_unregister() {
        let exposition = Exposition::new();
        let old = Registry::new(1).family(UP);
        let new = Registry::new(2).family(UP);

        exposition.register(&[&old]).expect("registration failed");
        assert!(exposition.unregister(&[&old]));
        assert!(exposition.is_empty());
        exposition.register(&[&new]).expect("re-registration failed");
        assert_eq!(exposition.live_epoch(), Some(2));
    }

    #[test]
    fn unregister_requires_same_registry() {
        let exposition = Exposition::new();
        let live = Registry::new(1).family(UP);
        let stranger = Registry::new(2).family(UP);

        exposition.register(&[&live]).expect("registration failed");
        assert!(!exposition.unregister(&[&stranger]));
        assert_eq!(exposition.len(), 1);
        assert!(exposition.unregister(&[&live]));
        assert!(!exposition.unregister(&[&live]));
    }

    #[test]
    fn swap_replaces_whole_epoch() {
        let exposition = Exposition::new();
        let old = Registry::new(1);
        let (old_up, old_calls) = (old.family(UP), old.family(CALLS));
        exposition
            .register(&[&old_up, &old_calls])
            .expect("registration failed");

        let new = Registry::new(2);
        let (new_up, new_calls) = (new.family(UP), new.family(CALLS));
        exposition
            .swap(&[&old_up, &old_calls], &[&new_up, &new_calls])
            .expect("swap failed");
        assert_eq!(exposition.len(), 2);
        assert_eq!(exposition.live_epoch(), Some(2));
    }

    #[test]
    fn swap_from_stale_epoch_leaves_nothing_live() {
        let exposition = Exposition::new();
        let live = Registry::new(1).family(UP);
        exposition.register(&[&live]).expect("registration failed");

        let stale = Registry::new(7).family(UP);
        let next = Registry::new(8).family(UP);
        assert_eq!(
            exposition.swap(&[&stale], &[&next]),
            Err(Error::NotLive("redis_server_up"))
        );
        assert_eq!(exposition.live_epoch(), Some(1));
        assert!(exposition.unregister(&[&live]));
    }

    #[test]
    fn swap_never_shows_partial_epoch() {
        let descs: Vec<Desc> = [UP, CALLS, MASTER].to_vec();
        let exposition = Arc::new(Exposition::new());
        let first = Registry::new(0);
        let mut live: Vec<Family> = descs.iter().map(|d| first.family(*d)).collect();
        exposition
            .register(&live.iter().collect::<Vec<_>>())
            .expect("registration failed");

        let done = Arc::new(AtomicBool::new(false));
        let torn = Arc::new(AtomicUsize::new(0));
        let observer = {
            let (exposition, done, torn) =
                (Arc::clone(&exposition), Arc::clone(&done), Arc::clone(&torn));
            thread::spawn(move || {
                while !done.load(Ordering::Acquire) {
                    if exposition.len() != 3 {
                        torn.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        };

        for epoch in 1..200 {
            let registry = Registry::new(epoch);
            let next: Vec<Family> = descs.iter().map(|d| registry.family(*d)).collect();
            exposition
                .swap(
                    &live.iter().collect::<Vec<_>>(),
                    &next.iter().collect::<Vec<_>>(),
                )
                .expect("swap failed");
            live = next;
        }
        done.store(true, Ordering::Release);
        observer.join().expect("observer panicked");

        assert_eq!(torn.load(Ordering::Relaxed), 0);
        assert_eq!(exposition.live_epoch(), Some(199));
    }

    #[test]
    fn render_sorted_with_help_and_type() {
        let exposition = Exposition::new();
        let registry = Registry::new(7);
        let up = registry.family(UP);
        let calls = registry.family(CALLS);
        exposition.register(&[&up, &calls]).expect("registration failed");

        up.gauge(&["b", "10.0.0.2:6379"]).set(0.0);
        up.gauge(&["a", "10.0.0.1:6379"]).set(1.0);
        calls.gauge(&["a", "10.0.0.1:6379", "get"]).set(42.0);

        let expected = "\
# HELP redis_commandstats_calls Calls per command
# TYPE redis_commandstats_calls counter
redis_commandstats_calls{node_name=\"a\",node_address=\"10.0.0.1:6379\",cmd=\"get\"} 42
# HELP redis_server_up Whether the last probe succeeded
# TYPE redis_server_up gauge
redis_server_up{node_name=\"a\",node_address=\"10.0.0.1:6379\"} 1
redis_server_up{node_name=\"b\",node_address=\"10.0.0.2:6379\"} 0
";
        assert_eq!(exposition.render(), expected);
    }

    #[test]
    fn counter_follows_lower_value() {
        let exposition = Exposition::new();
        let calls = Registry::new(1).family(CALLS);
        exposition.register(&[&calls]).expect("registration failed");

        let series = calls.gauge(&["a", "x", "get"]);
        series.set(1000.0);
        series.set(5.0);
        assert!(
            exposition
                .render()
                .contains("redis_commandstats_calls{node_name=\"a\",node_address=\"x\",cmd=\"get\"} 5\n")
        );
    }

    #[test]
    fn render_escapes_label_values() {
        let exposition = Exposition::new();
        let up = Registry::new(1).family(UP);
        exposition.register(&[&up]).expect("registration failed");
        up.gauge(&["we\"ird", "line\nbreak"]).set(0.5);

        let rendered = exposition.render();
        assert!(rendered.contains(
            "redis_server_up{node_name=\"we\\\"ird\",node_address=\"line\\nbreak\"} 0.5"
        ));
    }

    #[test]
    fn render_skips_unregistered_and_empty_families() {
        let exposition = Exposition::new();
        let registry = Registry::new(1);
        let up = registry.family(UP);
        let calls = registry.family(CALLS);
        exposition.register(&[&up, &calls]).expect("registration failed");
        up.gauge(&["a", "x"]).set(1.0);

        let rendered = exposition.render();
        assert!(rendered.contains("redis_server_up"));
        assert!(!rendered.contains("redis_commandstats_calls"));

        assert!(exposition.unregister(&[&up]));
        assert_eq!(exposition.render(), "");
    }

    #[test]
    fn set_only_retires_previous_identity_series() {
        let exposition = Exposition::new();
        let master = Registry::new(1).family(MASTER);
        exposition.register(&[&master]).expect("registration failed");

        master.set_only(&["a", "x", "10.0.0.5", "6379"], 2, 1.0);
        master.set_only(&["b", "y", "10.0.0.5", "6379"], 2, 1.0);
        master.set_only(&["a", "x", "10.0.0.6", "6379"], 2, 1.0);

        let rendered = exposition.render();
        assert!(!rendered.contains("node_name=\"a\",node_address=\"x\",host=\"10.0.0.5\""));
        assert!(rendered.contains("node_name=\"a\",node_address=\"x\",host=\"10.0.0.6\""));
        assert!(rendered.contains("node_name=\"b\",node_address=\"y\",host=\"10.0.0.5\""));

        master.retire(&["a", "x"]);
        let rendered = exposition.render();
        assert!(!rendered.contains("node_name=\"a\""));
        assert!(rendered.contains("node_name=\"b\""));
    }

    #[test]
    fn concurrent_writers_share_storage() {
        let registry = Registry::new(1);
        let up = registry.family(UP);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let up = up.clone();
                thread::spawn(move || {
                    let name = format!("node-{i}");
                    for _ in 0..100 {
                        up.gauge(&[name.as_str(), "addr"]).set(f64::from(i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("writer panicked");
        }

        let exposition = Exposition::new();
        exposition.register(&[&up]).expect("registration failed");
        assert_eq!(exposition.render().lines().count(), 2 + 8);
    }
}
