//! The scrape loop of a single node.
//!
//! Each iteration probes the node, fetches and parses its report and hands
//! the result to the epoch's [`Sink`]. Nothing that goes wrong inside an
//! iteration stops the loop, only the epoch's shutdown signal does. The
//! signal is checked between iterations and interrupts the sleep, it never
//! cuts an iteration short.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use metrics::{counter, histogram};
use redis_metrics_signal::Watcher;
use tokio::time;
use tracing::{debug, info, warn};

use crate::{
    client::Fetch,
    collector::{Node, Sink},
    config::Role,
    report::{self, Report},
};

/// How an iteration ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The report was collected and recorded.
    Up,
    /// The probe failed, the node was recorded as down.
    Down,
    /// The probe succeeded but the report could not be fetched or recorded.
    Failed,
}

impl Outcome {
    /// Label value used in self-telemetry.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Up => "up",
            Outcome::Down => "down",
            Outcome::Failed => "failed",
        }
    }
}

/// Scrapes one node until its epoch is stopped.
#[derive(Debug)]
pub struct NodeLoop<F, S> {
    node: Node,
    discover_masters: bool,
    fetch: F,
    sink: Arc<S>,
    interval: Duration,
    shutdown: Watcher,
}

impl<F, S> NodeLoop<F, S>
where
    F: Fetch,
    S: Sink,
{
    /// Create a loop for `node`. `shutdown` must be registered with the
    /// epoch's broadcaster so that stopping the epoch waits for this loop.
    #[must_use]
    pub fn new(node: Node, fetch: F, sink: Arc<S>, interval: Duration, shutdown: Watcher) -> Self {
        Self {
            node,
            discover_masters: false,
            fetch,
            sink,
            interval,
            shutdown,
        }
    }

    /// Also enumerate the masters a sentinel monitors on every iteration.
    /// Ignored for data nodes.
    #[must_use]
    pub fn discover_masters(mut self, enabled: bool) -> Self {
        self.discover_masters = enabled && self.node.role == Role::Sentinel;
        self
    }

    /// Run until the shutdown signal is observed.
    pub async fn run(mut self) {
        info!(node = %self.node.name, addr = %self.node.address, "Node loop starting");
        loop {
            if self.shutdown.is_signaled() {
                break;
            }
            self.scrape_once().await;

            tokio::select! {
                () = self.shutdown.recv() => break,
                () = time::sleep(self.interval) => {}
            }
        }
        info!(node = %self.node.name, addr = %self.node.address, "Node loop stopped");
    }

    /// Run a single probe, fetch, parse and record cycle.
    pub async fn scrape_once(&mut self) -> Outcome {
        let start = Instant::now();
        let outcome = if self.fetch.probe().await {
            self.collect().await
        } else {
            warn!(node = %self.node.name, addr = %self.node.address, "Node is unreachable");
            let recorded = self
                .sink
                .liveness(&self.node, false)
                .and_then(|()| self.sink.apply_report(&self.node, &Report::down()));
            match recorded {
                Ok(()) => Outcome::Down,
                Err(err) => self.sink_failed(&err),
            }
        };
        record_scrape(&self.node.name, outcome, start.elapsed());
        outcome
    }

    async fn collect(&mut self) -> Outcome {
        if let Err(err) = self.sink.liveness(&self.node, true) {
            return self.sink_failed(&err);
        }

        let text = match self.fetch.fetch_report().await {
            Ok(text) => text,
            Err(err) => {
                warn!(node = %self.node.name, addr = %self.node.address, "Failed to fetch report: {err}");
                // Reachable but no report: the sink gets the down marker, the
                // liveness recorded above stands.
                if let Err(err) = self.sink.apply_report(&self.node, &Report::down()) {
                    return self.sink_failed(&err);
                }
                return Outcome::Failed;
            }
        };
        let report = report::parse(&text);
        debug!(node = %self.node.name, fields = report.len(), "Report collected");
        if let Err(err) = self.sink.apply_report(&self.node, &report) {
            return self.sink_failed(&err);
        }

        if self.discover_masters {
            match self.fetch.sentinel_masters().await {
                Ok(masters) => {
                    if let Err(err) = self.sink.apply_masters(&self.node, &masters) {
                        return self.sink_failed(&err);
                    }
                }
                Err(err) => {
                    warn!(node = %self.node.name, addr = %self.node.address, "Failed to list sentinel masters: {err}");
                    return Outcome::Failed;
                }
            }
        }
        Outcome::Up
    }

    fn sink_failed(&self, err: &crate::collector::Error) -> Outcome {
        warn!(node = %self.node.name, addr = %self.node.address, "Failed to record scrape: {err}");
        Outcome::Failed
    }
}

fn record_scrape(node_name: &str, outcome: Outcome, elapsed: Duration) {
    counter!(
        "redis_metrics_scrapes_total",
        "node_name" => node_name.to_string(),
        "outcome" => outcome.as_str()
    )
    .increment(1);
    histogram!(
        "redis_metrics_scrape_duration_seconds",
        "node_name" => node_name.to_string()
    )
    .record(elapsed.as_secs_f64());
}
