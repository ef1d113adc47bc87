//! Redis and Sentinel INFO exporter.
//!
//! This library supports the `redis-metrics` binary found elsewhere in this
//! project. Each node named in the configuration is scraped on its own loop,
//! its INFO report parsed and mapped onto Prometheus families that are served
//! over HTTP. Configuration reloads replace the whole set of loops and
//! families at once, see [`controller`].

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![warn(unreachable_pub)]
#![deny(missing_docs)]
#![warn(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

pub mod client;
pub mod collector;
pub mod config;
pub mod controller;
pub mod epoch;
pub mod registry;
pub mod reload;
pub mod report;
pub mod scrape;
pub mod server;
