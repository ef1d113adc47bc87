//! Memory use, allocator statistics, eviction policy and allocator identity.

use super::{Field, NODE_LABELS, Node, Scalars, Value, gauge};
use crate::{
    registry::{Desc, Family, Kind, Registry},
    report::Report,
};

/// `maxmemory_policy` values. Unknown policies report as `noeviction`.
const POLICIES: Value = Value::Enum(
    &[
        ("volatile-lru", 0.0),
        ("allkeys-lru", 1.0),
        ("volatile-lfu", 2.0),
        ("allkeys-lfu", 3.0),
        ("volatile-random", 4.0),
        ("allkeys-random", 5.0),
        ("volatile-ttl", 6.0),
        ("noeviction", 7.0),
    ],
    Some(7.0),
);

pub(crate) const FIELDS: &[Field] = &[
    gauge(
        "used_memory",
        "redis_memory_used_memory",
        "Bytes allocated by the server.",
    ),
    gauge(
        "used_memory_rss",
        "redis_memory_used_memory_rss",
        "Resident set size of the server in bytes.",
    ),
    gauge(
        "used_memory_peak",
        "redis_memory_used_memory_peak",
        "Peak bytes allocated by the server.",
    ),
    gauge(
        "used_memory_overhead",
        "redis_memory_used_memory_overhead",
        "Bytes used for internal bookkeeping.",
    ),
    gauge(
        "used_memory_startup",
        "redis_memory_used_memory_startup",
        "Bytes allocated at startup.",
    ),
    gauge(
        "used_memory_dataset",
        "redis_memory_used_memory_dataset",
        "Bytes used by the dataset.",
    ),
    gauge(
        "total_system_memory",
        "redis_memory_total_system_memory",
        "Total memory of the host in bytes.",
    ),
    gauge(
        "used_memory_lua",
        "redis_memory_used_memory_lua",
        "Bytes used by the Lua engine.",
    ),
    gauge(
        "used_memory_scripts",
        "redis_memory_used_memory_scripts",
        "Bytes used by cached scripts.",
    ),
    gauge(
        "number_of_cached_scripts",
        "redis_memory_number_of_cached_scripts",
        "Number of cached scripts.",
    ),
    gauge(
        "maxmemory",
        "redis_memory_maxmemory",
        "Configured memory limit in bytes.",
    ),
    gauge(
        "maxmemory_policy",
        "redis_memory_maxmemory_policy",
        "Eviction policy: volatile-lru 0, allkeys-lru 1, volatile-lfu 2, allkeys-lfu 3, volatile-random 4, allkeys-random 5, volatile-ttl 6, noeviction 7.",
    )
    .value(POLICIES),
    gauge(
        "allocator_allocated",
        "redis_memory_allocator_allocated",
        "Bytes allocated according to the allocator.",
    ),
    gauge(
        "allocator_active",
        "redis_memory_allocator_active",
        "Bytes in active allocator pages.",
    ),
    gauge(
        "allocator_resident",
        "redis_memory_allocator_resident",
        "Bytes resident according to the allocator.",
    ),
    gauge(
        "allocator_frag_ratio",
        "redis_memory_allocator_frag_ratio",
        "Ratio of allocator active to allocated bytes.",
    ),
    gauge(
        "allocator_frag_bytes",
        "redis_memory_allocator_frag_bytes",
        "Difference of allocator active and allocated bytes.",
    ),
    gauge(
        "allocator_rss_ratio",
        "redis_memory_allocator_rss_ratio",
        "Ratio of allocator resident to active bytes.",
    ),
    gauge(
        "allocator_rss_bytes",
        "redis_memory_allocator_rss_bytes",
        "Difference of allocator resident and active bytes.",
    ),
    gauge(
        "rss_overhead_ratio",
        "redis_memory_rss_overhead_ratio",
        "Ratio of process RSS to allocator resident bytes.",
    ),
    gauge(
        "rss_overhead_bytes",
        "redis_memory_rss_overhead_bytes",
        "Difference of process RSS and allocator resident bytes.",
    ),
    gauge(
        "mem_fragmentation_ratio",
        "redis_memory_mem_fragmentation_ratio",
        "Ratio of RSS to used memory.",
    ),
    gauge(
        "mem_fragmentation_bytes",
        "redis_memory_mem_fragmentation_bytes",
        "Difference of RSS and used memory.",
    ),
    gauge(
        "mem_not_counted_for_evict",
        "redis_memory_mem_not_counted_for_evict",
        "Bytes excluded from the maxmemory check.",
    ),
    gauge(
        "mem_replication_backlog",
        "redis_memory_mem_replication_backlog",
        "Bytes used by the replication backlog.",
    ),
    gauge(
        "mem_clients_slaves",
        "redis_memory_mem_clients_slaves",
        "Bytes used by replica client buffers.",
    ),
    gauge(
        "mem_clients_normal",
        "redis_memory_mem_clients_normal",
        "Bytes used by normal client buffers.",
    ),
    gauge(
        "mem_aof_buffer",
        "redis_memory_mem_aof_buffer",
        "Bytes used by the AOF buffers.",
    ),
    gauge(
        "active_defrag_running",
        "redis_memory_active_defrag_running",
        "Whether active defragmentation is running.",
    ),
    gauge(
        "lazyfree_pending_objects",
        "redis_memory_lazyfree_pending_objects",
        "Objects waiting to be freed in the background.",
    ),
];

const ALLOCATOR: Desc = Desc {
    name: "redis_memory_mem_allocator",
    help: "Memory allocator the server was built with.",
    kind: Kind::Gauge,
    labels: &["node_name", "node_address", "allocator"],
};

#[derive(Debug)]
pub(crate) struct Memory {
    scalars: Scalars,
    allocator: Family,
}

impl Memory {
    pub(crate) fn new(registry: &Registry) -> Self {
        debug_assert_eq!(&ALLOCATOR.labels[..2], NODE_LABELS);
        Self {
            scalars: Scalars::new(registry, FIELDS),
            allocator: registry.family(ALLOCATOR),
        }
    }

    pub(crate) fn families(&self) -> Vec<&Family> {
        let mut families = self.scalars.families();
        families.push(&self.allocator);
        families
    }

    pub(crate) fn apply(&self, node: &Node, report: &Report) {
        self.scalars.apply(node, report);
        if let Some(allocator) = report.get("mem_allocator") {
            self.allocator.set_only(
                &[node.name.as_str(), node.address.as_str(), allocator.trim()],
                NODE_LABELS.len(),
                1.0,
            );
        }
    }
}
