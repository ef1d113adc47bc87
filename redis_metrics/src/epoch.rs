//! One generation of scraping: a registry, its collectors and the node loops
//! writing into them.
//!
//! An epoch is started with [`Epoch::start`], which registers every family
//! before any loop runs. [`Epoch::stop`] cancels the loops and waits for all
//! of them to return, producing a [`Stopped`] epoch. Only a stopped epoch can
//! be unregistered or handed over to its successor, so no loop can ever
//! write into families that are no longer live. [`Stopped::hand_over`] swaps
//! the families of both epochs in one step, the exposition always shows
//! exactly one of them.

use std::{sync::Arc, time::Duration};

use redis_metrics_signal::{Broadcaster, RegisterError};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::{
    client::Connect,
    collector::{self, Node, Sink},
    config::Config,
    registry::{self, Exposition, Registry},
    scrape::NodeLoop,
};

/// Errors produced by [`Epoch`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Registration of the epoch's families failed.
    #[error("Failed to register epoch {id}: {source}")]
    Register {
        /// Epoch id
        id: u64,
        /// Underlying sink error
        #[source]
        source: collector::Error,
    },
    /// A node loop could not join the epoch's shutdown signal.
    #[error(transparent)]
    Signal(#[from] RegisterError),
    /// Some family of the epoch was not live when it was unregistered.
    #[error("Epoch {0} was only partially unregistered")]
    Unregister(u64),
}

/// A running epoch.
#[derive(Debug)]
pub struct Epoch<S> {
    id: u64,
    registry: Registry,
    sink: Arc<S>,
    exposition: Arc<Exposition>,
    broadcaster: Broadcaster,
    loops: JoinSet<()>,
}

impl<S: Sink> Epoch<S> {
    /// Build a fresh registry for epoch `id`, bind a sink to it with `build`,
    /// register every family and spawn one loop per node of `config`.
    ///
    /// # Errors
    ///
    /// Fails if the sink's families can't be registered, typically because a
    /// previous epoch is still live. Nothing is spawned in that case.
    pub fn start<C, B>(
        id: u64,
        config: &Config,
        interval: Duration,
        exposition: Arc<Exposition>,
        connector: &C,
        build: B,
    ) -> Result<Self, Error>
    where
        C: Connect,
        B: FnOnce(&Registry) -> S,
    {
        let registry = Registry::new(id);
        let sink = Arc::new(build(&registry));
        sink.register_all(&exposition)
            .map_err(|source| Error::Register { id, source })?;
        Self::launch(id, registry, sink, config, interval, exposition, connector)
    }

    /// Spawn the node loops of an epoch whose families are live.
    fn launch<C: Connect>(
        id: u64,
        registry: Registry,
        sink: Arc<S>,
        config: &Config,
        interval: Duration,
        exposition: Arc<Exposition>,
        connector: &C,
    ) -> Result<Self, Error> {
        let (watcher, broadcaster) = redis_metrics_signal::signal();
        let mut loops = JoinSet::new();
        for spec in config.nodes() {
            if spec.discovery.replicas || spec.discovery.sentinels {
                warn!(node = %spec.name, addr = %spec.address, "Replica and sentinel discovery are not supported, ignoring");
            }
            let node_loop = NodeLoop::new(
                Node::from(spec),
                connector.connect(spec),
                Arc::clone(&sink),
                interval,
                watcher.register()?,
            )
            .discover_masters(spec.discovery.masters);
            loops.spawn(node_loop.run());
        }
        // Only the loops' watchers may hold up `signal_and_wait`.
        drop(watcher);

        info!(epoch = id, nodes = config.len(), ?interval, "Epoch started");
        Ok(Self {
            id,
            registry,
            sink,
            exposition,
            broadcaster,
            loops,
        })
    }

    /// The epoch id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The registry this epoch writes to.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Cancel every node loop and wait until all of them have returned.
    pub async fn stop(self) -> Stopped<S> {
        let Self {
            id,
            registry,
            sink,
            exposition,
            broadcaster,
            mut loops,
        } = self;

        info!(epoch = id, peers = broadcaster.peers(), "Stopping epoch");
        broadcaster.signal_and_wait().await;
        while let Some(res) = loops.join_next().await {
            if let Err(err) = res {
                warn!(epoch = id, "Node loop failed: {err}");
            }
        }
        info!(epoch = id, "Epoch drained");

        Stopped {
            id,
            registry,
            sink,
            exposition,
        }
    }
}

/// An epoch whose node loops have all returned.
#[derive(Debug)]
pub struct Stopped<S> {
    id: u64,
    registry: Registry,
    sink: Arc<S>,
    exposition: Arc<Exposition>,
}

impl<S: Sink> Stopped<S> {
    /// The epoch id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The registry the epoch wrote to.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Hand the exposition over to a new epoch `id` for `config`: this
    /// epoch's families are replaced by the new epoch's in a single step and
    /// only then are the new node loops spawned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unregister`] if some family of this epoch was not
    /// live and [`Error::Register`] if the new families can't be registered.
    /// In both cases neither epoch is live afterwards and nothing is spawned.
    pub fn hand_over<C, B>(
        self,
        id: u64,
        config: &Config,
        interval: Duration,
        connector: &C,
        build: B,
    ) -> Result<Epoch<S>, Error>
    where
        C: Connect,
        B: FnOnce(&Registry) -> S,
    {
        let registry = Registry::new(id);
        let sink = Arc::new(build(&registry));
        match sink.replace(&self.sink, &self.exposition) {
            Ok(()) => {}
            Err(collector::Error::Registry(registry::Error::NotLive(_))) => {
                return Err(Error::Unregister(self.id));
            }
            Err(source) => return Err(Error::Register { id, source }),
        }
        info!(from = self.id, to = id, "Epoch handed over");
        Epoch::launch(
            id,
            registry,
            sink,
            config,
            interval,
            self.exposition,
            connector,
        )
    }

    /// Remove every family of the epoch from the exposition.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unregister`] if any family was not live. Families
    /// that were live are removed regardless.
    pub fn unregister(self) -> Result<(), Error> {
        if self.sink.unregister_all(&self.exposition) {
            info!(epoch = self.id, "Epoch unregistered");
            Ok(())
        } else {
            Err(Error::Unregister(self.id))
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::time;

    use super::*;
    use crate::{
        client::{self, Fetch},
        collector::Collectors,
        config::NodeSpec,
        report::Report,
    };

    /// Connects to nothing. Every node answers with a small report.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct FakeConnector {
        pub(crate) scrapes: Arc<AtomicUsize>,
    }

    #[derive(Debug)]
    pub(crate) struct FakeFetch {
        scrapes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Fetch for FakeFetch {
        async fn probe(&mut self) -> bool {
            true
        }

        async fn fetch_report(&mut self) -> Result<String, client::Error> {
            self.scrapes.fetch_add(1, Ordering::SeqCst);
            Ok("connected_clients:1\r\n".to_string())
        }

        async fn sentinel_masters(&mut self) -> Result<Vec<Report>, client::Error> {
            Ok(Vec::new())
        }
    }

    impl Connect for FakeConnector {
        type Fetch = FakeFetch;

        fn connect(&self, _spec: &NodeSpec) -> FakeFetch {
            FakeFetch {
                scrapes: Arc::clone(&self.scrapes),
            }
        }
    }

    pub(crate) fn two_nodes() -> Config {
        Config::from_yaml(
            "standalone:\n  - name: a\n    port: 7001\n  - name: b\n    port: 7002\n",
        )
        .expect("invalid config")
    }

    /// A sink that registers nothing and can be told to fail unregistration.
    #[derive(Debug, Default)]
    struct Leaky {
        lose_families: AtomicBool,
    }

    impl Sink for Leaky {
        fn register_all(&self, _exposition: &Exposition) -> Result<(), collector::Error> {
            Ok(())
        }

        fn unregister_all(&self, _exposition: &Exposition) -> bool {
            !self.lose_families.load(Ordering::SeqCst)
        }

        fn replace(&self, old: &Self, _exposition: &Exposition) -> Result<(), collector::Error> {
            if old.lose_families.load(Ordering::SeqCst) {
                Err(collector::Error::Registry(registry::Error::NotLive(
                    "redis_server_up",
                )))
            } else {
                Ok(())
            }
        }

        fn liveness(&self, _node: &Node, _up: bool) -> Result<(), collector::Error> {
            Ok(())
        }

        fn apply_report(&self, _node: &Node, _report: &Report) -> Result<(), collector::Error> {
            Ok(())
        }

        fn apply_masters(&self, _node: &Node, _masters: &[Report]) -> Result<(), collector::Error> {
            Ok(())
        }
    }

    const INTERVAL: Duration = Duration::from_secs(20);

    #[tokio::test(start_paused = true)]
    async fn restart_with_same_families() {
        let exposition = Arc::new(Exposition::new());
        let connector = FakeConnector::default();
        let config = two_nodes();

        let first = Epoch::start(
            1,
            &config,
            INTERVAL,
            Arc::clone(&exposition),
            &connector,
            Collectors::new,
        )
        .expect("first epoch failed to start");
        assert_eq!(exposition.live_epoch(), Some(1));

        // While the first epoch is live a second one is refused.
        let refused = Epoch::start(
            2,
            &config,
            INTERVAL,
            Arc::clone(&exposition),
            &connector,
            Collectors::new,
        );
        assert!(matches!(refused, Err(Error::Register { id: 2, .. })));
        assert_eq!(exposition.live_epoch(), Some(1));

        first
            .stop()
            .await
            .unregister()
            .expect("unregister failed");
        assert!(exposition.is_empty());

        let second = Epoch::start(
            2,
            &config,
            INTERVAL,
            Arc::clone(&exposition),
            &connector,
            Collectors::new,
        )
        .expect("second epoch failed to start");
        assert_eq!(second.id(), 2);
        assert_eq!(exposition.live_epoch(), Some(2));
        second.stop().await.unregister().expect("unregister failed");
    }

    #[tokio::test(start_paused = true)]
    async fn no_writes_after_stop() {
        let exposition = Arc::new(Exposition::new());
        let connector = FakeConnector::default();

        let epoch = Epoch::start(
            1,
            &two_nodes(),
            INTERVAL,
            Arc::clone(&exposition),
            &connector,
            Collectors::new,
        )
        .expect("epoch failed to start");
        time::sleep(Duration::from_secs(30)).await;
        let stopped = epoch.stop().await;

        // Two nodes, iterations at 0 and 20 seconds.
        assert_eq!(connector.scrapes.load(Ordering::SeqCst), 4);
        let rendered = exposition.render();
        time::sleep(Duration::from_secs(600)).await;
        assert_eq!(connector.scrapes.load(Ordering::SeqCst), 4);
        assert_eq!(exposition.render(), rendered);

        stopped.unregister().expect("unregister failed");
    }

    #[tokio::test(start_paused = true)]
    async fn hand_over_keeps_one_epoch_live() {
        let exposition = Arc::new(Exposition::new());
        let connector = FakeConnector::default();

        let first = Epoch::start(
            1,
            &two_nodes(),
            INTERVAL,
            Arc::clone(&exposition),
            &connector,
            Collectors::new,
        )
        .expect("first epoch failed to start");
        let families = exposition.len();
        time::sleep(Duration::from_secs(1)).await;

        let stopped = first.stop().await;
        // Stopped but not yet replaced, the old families are still served.
        assert_eq!(exposition.live_epoch(), Some(1));
        assert_eq!(exposition.len(), families);

        let second = stopped
            .hand_over(2, &two_nodes(), INTERVAL, &connector, Collectors::new)
            .expect("hand over failed");
        assert_eq!(second.id(), 2);
        assert_eq!(exposition.live_epoch(), Some(2));
        assert_eq!(exposition.len(), families);

        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(connector.scrapes.load(Ordering::SeqCst), 4);
        second.stop().await.unregister().expect("unregister failed");
        assert!(exposition.is_empty());
    }

    #[tokio::test]
    async fn hand_over_from_lost_families_is_an_error() {
        let exposition = Arc::new(Exposition::new());
        let epoch = Epoch::start(
            3,
            &Config::default(),
            INTERVAL,
            exposition,
            &FakeConnector::default(),
            |_: &Registry| Leaky::default(),
        )
        .expect("epoch failed to start");
        epoch.sink.lose_families.store(true, Ordering::SeqCst);

        let res = epoch.stop().await.hand_over(
            4,
            &Config::default(),
            INTERVAL,
            &FakeConnector::default(),
            |_: &Registry| Leaky::default(),
        );
        assert!(matches!(res, Err(Error::Unregister(3))));
    }

    #[tokio::test]
    async fn partial_unregister_is_an_error() {
        let exposition = Arc::new(Exposition::new());
        let epoch = Epoch::start(
            5,
            &Config::default(),
            INTERVAL,
            exposition,
            &FakeConnector::default(),
            |_: &Registry| Leaky::default(),
        )
        .expect("epoch failed to start");
        epoch.sink.lose_families.store(true, Ordering::SeqCst);

        let stopped = epoch.stop().await;
        assert_eq!(stopped.id(), 5);
        assert!(matches!(stopped.unregister(), Err(Error::Unregister(5))));
    }
}
