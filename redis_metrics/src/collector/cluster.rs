use super::{Field, gauge};

pub(crate) const FIELDS: &[Field] = &[gauge(
    "cluster_enabled",
    "redis_cluster_cluster_enabled",
    "Whether cluster mode is enabled.",
)];
