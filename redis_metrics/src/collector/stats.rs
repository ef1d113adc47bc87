//! General statistics. Running totals are counters, rates and current
//! values are gauges.

use super::{Field, counter, gauge};

pub(crate) const FIELDS: &[Field] = &[
    counter(
        "total_connections_received",
        "redis_stats_total_connections_received",
        "Connections accepted by the server.",
    ),
    counter(
        "total_commands_processed",
        "redis_stats_total_commands_processed",
        "Commands processed by the server.",
    ),
    gauge(
        "instantaneous_ops_per_sec",
        "redis_stats_instantaneous_ops_per_sec",
        "Commands processed per second.",
    ),
    counter(
        "total_net_input_bytes",
        "redis_stats_total_net_input_bytes",
        "Bytes read from the network.",
    ),
    counter(
        "total_net_output_bytes",
        "redis_stats_total_net_output_bytes",
        "Bytes written to the network.",
    ),
    gauge(
        "instantaneous_input_kbps",
        "redis_stats_instantaneous_input_kbps",
        "Network read rate in KB/sec.",
    ),
    gauge(
        "instantaneous_output_kbps",
        "redis_stats_instantaneous_output_kbps",
        "Network write rate in KB/sec.",
    ),
    counter(
        "rejected_connections",
        "redis_stats_rejected_connections",
        "Connections rejected because of maxclients.",
    ),
    counter(
        "sync_full",
        "redis_stats_sync_full",
        "Full resynchronizations with replicas.",
    ),
    counter(
        "sync_partial_ok",
        "redis_stats_sync_partial_ok",
        "Accepted partial resynchronization requests.",
    ),
    counter(
        "sync_partial_err",
        "redis_stats_sync_partial_err",
        "Denied partial resynchronization requests.",
    ),
    counter(
        "expired_keys",
        "redis_stats_expired_keys",
        "Key expiration events.",
    ),
    gauge(
        "expired_stale_perc",
        "redis_stats_expired_stale_perc",
        "Estimated percentage of keys that are expired but not yet reclaimed.",
    ),
    counter(
        "expired_time_cap_reached_count",
        "redis_stats_expired_time_cap_reached_count",
        "Active expiry cycles stopped early by the time limit.",
    ),
    counter(
        "evicted_keys",
        "redis_stats_evicted_keys",
        "Keys evicted because of the maxmemory limit.",
    ),
    counter(
        "keyspace_hits",
        "redis_stats_keyspace_hits",
        "Successful key lookups.",
    ),
    counter(
        "keyspace_misses",
        "redis_stats_keyspace_misses",
        "Failed key lookups.",
    ),
    gauge(
        "pubsub_channels",
        "redis_stats_pubsub_channels",
        "Channels with client subscriptions.",
    ),
    gauge(
        "pubsub_patterns",
        "redis_stats_pubsub_patterns",
        "Patterns with client subscriptions.",
    ),
    gauge(
        "latest_fork_usec",
        "redis_stats_latest_fork_usec",
        "Duration of the latest fork in microseconds.",
    ),
    gauge(
        "migrate_cached_sockets",
        "redis_stats_migrate_cached_sockets",
        "Sockets open for MIGRATE.",
    ),
    gauge(
        "slave_expires_tracked_keys",
        "redis_stats_slave_expires_tracked_keys",
        "Keys tracked for expiry on a writable replica.",
    ),
    counter(
        "active_defrag_hits",
        "redis_stats_active_defrag_hits",
        "Value reallocations performed by active defragmentation.",
    ),
    counter(
        "active_defrag_misses",
        "redis_stats_active_defrag_misses",
        "Value reallocations skipped by active defragmentation.",
    ),
    counter(
        "active_defrag_key_hits",
        "redis_stats_active_defrag_key_hits",
        "Keys actively defragmented.",
    ),
    counter(
        "active_defrag_key_misses",
        "redis_stats_active_defrag_key_misses",
        "Keys skipped by active defragmentation.",
    ),
];

#[cfg(test)]
mod tests {
    use crate::collector::{
        Sink,
        tests::{NODE, live, sample, standalone},
    };
    use crate::report;

    #[test]
    fn counters_and_gauges() {
        let (collectors, exposition) = live();
        let report = report::parse(
            "# Stats\r\ntotal_commands_processed:1800\r\nexpired_stale_perc:0.25\r\nkeyspace_hits:1.5\r\n",
        );
        collectors
            .apply_report(&standalone(), &report)
            .expect("apply failed");

        let rendered = exposition.render();
        assert!(rendered.contains("# TYPE redis_stats_total_commands_processed counter"));
        assert!(rendered.contains("# TYPE redis_stats_expired_stale_perc gauge"));

        let get = |name: &str| sample(&exposition, &format!("{name}{{{NODE}}}"));
        assert_eq!(
            get("redis_stats_total_commands_processed").as_deref(),
            Some("1800")
        );
        assert_eq!(get("redis_stats_expired_stale_perc").as_deref(), Some("0.25"));
        // Counters only accept whole numbers.
        assert_eq!(get("redis_stats_keyspace_hits"), None);
    }
}
