//! RDB and AOF state. The `*_status` fields export 1 for `ok`.

use super::{Field, Value, gauge};

const OK: Value = Value::Status("ok");

pub(crate) const FIELDS: &[Field] = &[
    gauge(
        "loading",
        "redis_persistence_loading",
        "Whether a dump file is being loaded.",
    ),
    gauge(
        "rdb_changes_since_last_save",
        "redis_persistence_rdb_changes_since_last_save",
        "Changes since the last dump.",
    ),
    gauge(
        "rdb_bgsave_in_progress",
        "redis_persistence_rdb_bgsave_in_progress",
        "Whether an RDB save is in progress.",
    ),
    gauge(
        "rdb_last_save_time",
        "redis_persistence_rdb_last_save_time",
        "Unix time of the last successful RDB save.",
    ),
    gauge(
        "rdb_last_bgsave_status",
        "redis_persistence_rdb_last_bgsave_status",
        "Whether the last RDB save succeeded.",
    )
    .value(OK),
    gauge(
        "rdb_last_bgsave_time_sec",
        "redis_persistence_rdb_last_bgsave_time_sec",
        "Duration of the last RDB save in seconds.",
    ),
    gauge(
        "rdb_current_bgsave_time_sec",
        "redis_persistence_rdb_current_bgsave_time_sec",
        "Duration of the running RDB save in seconds.",
    ),
    gauge(
        "rdb_last_cow_size",
        "redis_persistence_rdb_last_cow_size",
        "Copy-on-write bytes during the last RDB save.",
    ),
    gauge(
        "aof_enabled",
        "redis_persistence_aof_enabled",
        "Whether AOF logging is enabled.",
    ),
    gauge(
        "aof_rewrite_in_progress",
        "redis_persistence_aof_rewrite_in_progress",
        "Whether an AOF rewrite is in progress.",
    ),
    gauge(
        "aof_rewrite_scheduled",
        "redis_persistence_aof_rewrite_scheduled",
        "Whether an AOF rewrite is scheduled after the running RDB save.",
    ),
    gauge(
        "aof_last_rewrite_time_sec",
        "redis_persistence_aof_last_rewrite_time_sec",
        "Duration of the last AOF rewrite in seconds.",
    ),
    gauge(
        "aof_current_rewrite_time_sec",
        "redis_persistence_aof_current_rewrite_time_sec",
        "Duration of the running AOF rewrite in seconds.",
    ),
    gauge(
        "aof_last_bgrewrite_status",
        "redis_persistence_aof_last_bgrewrite_status",
        "Whether the last AOF rewrite succeeded.",
    )
    .value(OK),
    gauge(
        "aof_last_write_status",
        "redis_persistence_aof_last_write_status",
        "Whether the last AOF write succeeded.",
    )
    .value(OK),
    gauge(
        "aof_last_cow_size",
        "redis_persistence_aof_last_cow_size",
        "Copy-on-write bytes during the last AOF rewrite.",
    ),
];
