//! The reload controller.
//!
//! The controller owns the live [`Epoch`] and replaces it wholesale when the
//! configuration changes. Its transitions live in [`state_machine`], this
//! module only performs the operations the machine asks for: loading
//! configuration, starting and stopping epochs, waiting on the reload and
//! shutdown signals.
//!
//! A configuration that fails to load at boot is fatal. Later, a reload that
//! fails or that produces an equal configuration leaves the live epoch alone.
//! A changed configuration stops the live epoch and hands its families over to
//! the next one in a single step, so a family name is never live twice and a
//! scrape never finds no epoch at all.

pub mod state_machine;

use std::{sync::Arc, time::Duration};

use metrics::{counter, gauge};
use redis_metrics_signal::Watcher;
use tokio::sync::watch;
use tracing::{error, info, warn};

use self::state_machine::{Event, Operation, Reloaded, StateMachine};
use crate::{
    client::Connect,
    collector::Collectors,
    config::{self, Config, Source},
    epoch::{self, Epoch},
    registry::{Exposition, Registry},
    reload,
};

/// Lower bound of the scrape interval.
pub const MIN_INTERVAL: Duration = Duration::from_secs(20);
/// Upper bound of the scrape interval.
pub const MAX_INTERVAL: Duration = Duration::from_secs(600);

/// Scrape interval for a configured number of seconds, clamped to
/// [`MIN_INTERVAL`]..=[`MAX_INTERVAL`].
#[must_use]
pub fn clamp_interval(seconds: u64) -> Duration {
    Duration::from_secs(seconds).clamp(MIN_INTERVAL, MAX_INTERVAL)
}

/// Errors produced by [`Controller`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The initial configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] config::Error),
    /// An epoch could not be started or fully unregistered.
    #[error(transparent)]
    Epoch(#[from] epoch::Error),
    /// The controller attempted an invalid transition.
    #[error(transparent)]
    StateMachine(#[from] state_machine::Error),
    /// The state machine failed without a recorded cause.
    #[error("Controller failed")]
    Failed,
}

/// What the controller is currently serving.
#[derive(Debug, Clone, Default)]
pub struct Status {
    /// Id of the live epoch, 0 before the first one starts.
    pub epoch: u64,
    /// Reload requests handled so far, whatever their outcome.
    pub reloads: u64,
    /// Registry of the live epoch.
    pub registry: Option<Registry>,
}

/// Drives epochs through configuration changes.
#[derive(Debug)]
pub struct Controller<Src, C> {
    source: Src,
    connector: C,
    interval: Duration,
    exposition: Arc<Exposition>,
    status: watch::Sender<Status>,
}

impl<Src, C> Controller<Src, C>
where
    Src: Source,
    C: Connect,
{
    /// Create a controller loading configuration from `source` and scraping
    /// every `interval` into `exposition`.
    #[must_use]
    pub fn new(source: Src, connector: C, interval: Duration, exposition: Arc<Exposition>) -> Self {
        let (status, _) = watch::channel(Status::default());
        Self {
            source,
            connector,
            interval,
            exposition,
            status,
        }
    }

    /// Observe the controller's status.
    #[must_use]
    pub fn status(&self) -> watch::Receiver<Status> {
        self.status.subscribe()
    }

    /// Run until `shutdown` is signaled.
    ///
    /// # Errors
    ///
    /// Fails if the initial configuration does not load, if an epoch can't be
    /// started or if an epoch is only partially unregistered. In the last two
    /// cases no epoch is live when this returns.
    pub async fn run(
        self,
        mut reloads: reload::Listener,
        mut shutdown: Watcher,
    ) -> Result<(), Error> {
        let mut machine = StateMachine::new();
        let mut failure: Option<Error> = None;
        let mut live: Option<Epoch<Collectors>> = None;
        let mut next_id: u64 = 1;
        let mut reloads_open = true;

        let (mut current, mut op) = match self.source.load() {
            Ok(config) => {
                info!(nodes = config.len(), "Configuration loaded");
                (config, machine.next(Event::Loaded { success: true })?)
            }
            Err(err) => {
                error!("Failed to load configuration: {err}");
                failure = Some(err.into());
                (Config::default(), machine.next(Event::Loaded { success: false })?)
            }
        };
        let mut pending: Option<Config> = None;

        loop {
            op = match op {
                Operation::StartEpoch => {
                    let id = next_id;
                    next_id += 1;
                    match Epoch::start(
                        id,
                        &current,
                        self.interval,
                        Arc::clone(&self.exposition),
                        &self.connector,
                        Collectors::new,
                    ) {
                        Ok(epoch) => {
                            gauge!("redis_metrics_epoch").set(id as f64);
                            self.status.send_modify(|status| {
                                status.epoch = id;
                                status.registry = Some(epoch.registry().clone());
                            });
                            live = Some(epoch);
                            machine.next(Event::EpochStarted { success: true })?
                        }
                        Err(err) => {
                            error!("Failed to start epoch {id}: {err}");
                            failure = Some(err.into());
                            machine.next(Event::EpochStarted { success: false })?
                        }
                    }
                }
                Operation::Wait => {
                    let event = tokio::select! {
                        () = shutdown.recv() => Event::ShutdownSignaled,
                        request = reloads.recv(), if reloads_open => match request {
                            Some(()) => Event::ReloadRequested,
                            None => {
                                reloads_open = false;
                                continue;
                            }
                        },
                    };
                    if event == Event::ShutdownSignaled {
                        info!("Shutdown signal received");
                    }
                    machine.next(event)?
                }
                Operation::ReloadConfig => {
                    let outcome = match self.source.load() {
                        Ok(config) if self.source.equal(&config, &current) => {
                            info!("Configuration unchanged, keeping epoch");
                            Reloaded::Unchanged
                        }
                        Ok(config) => {
                            info!(nodes = config.len(), "Configuration changed");
                            pending = Some(config);
                            Reloaded::Changed
                        }
                        Err(err) => {
                            warn!("Failed to reload configuration, keeping epoch: {err}");
                            Reloaded::Failed
                        }
                    };
                    counter!("redis_metrics_reloads_total", "outcome" => outcome.as_str())
                        .increment(1);
                    self.status.send_modify(|status| status.reloads += 1);
                    machine.next(Event::ConfigReloaded(outcome))?
                }
                Operation::SwapEpoch => {
                    let id = next_id;
                    next_id += 1;
                    let config = pending.take().unwrap_or_else(|| current.clone());
                    let swapped = match live.take() {
                        Some(epoch) => epoch.stop().await.hand_over(
                            id,
                            &config,
                            self.interval,
                            &self.connector,
                            Collectors::new,
                        ),
                        None => Epoch::start(
                            id,
                            &config,
                            self.interval,
                            Arc::clone(&self.exposition),
                            &self.connector,
                            Collectors::new,
                        ),
                    };
                    current = config;
                    match swapped {
                        Ok(epoch) => {
                            gauge!("redis_metrics_epoch").set(id as f64);
                            self.status.send_modify(|status| {
                                status.epoch = id;
                                status.registry = Some(epoch.registry().clone());
                            });
                            live = Some(epoch);
                            machine.next(Event::EpochSwapped { success: true })?
                        }
                        Err(err) => {
                            error!("Failed to replace the live epoch with epoch {id}: {err}");
                            self.status.send_modify(|status| {
                                status.epoch = 0;
                                status.registry = None;
                            });
                            failure = Some(err.into());
                            machine.next(Event::EpochSwapped { success: false })?
                        }
                    }
                }
                Operation::StopEpoch => {
                    let unregistered = match live.take() {
                        Some(epoch) => match epoch.stop().await.unregister() {
                            Ok(()) => true,
                            Err(err) => {
                                error!("{err}");
                                failure = Some(err.into());
                                false
                            }
                        },
                        None => true,
                    };
                    self.status.send_modify(|status| {
                        status.epoch = 0;
                        status.registry = None;
                    });
                    machine.next(Event::EpochDrained { unregistered })?
                }
                Operation::Exit => {
                    info!("Controller stopped");
                    return Ok(());
                }
                Operation::Fail => return Err(failure.take().unwrap_or(Error::Failed)),
            };
        }
    }
}
