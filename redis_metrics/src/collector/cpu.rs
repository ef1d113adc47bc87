use super::{Field, gauge};

pub(crate) const FIELDS: &[Field] = &[
    gauge(
        "used_cpu_sys",
        "redis_cpu_used_cpu_sys",
        "System CPU seconds consumed by the server.",
    ),
    gauge(
        "used_cpu_user",
        "redis_cpu_used_cpu_user",
        "User CPU seconds consumed by the server.",
    ),
    gauge(
        "used_cpu_sys_children",
        "redis_cpu_used_cpu_sys_children",
        "System CPU seconds consumed by background processes.",
    ),
    gauge(
        "used_cpu_user_children",
        "redis_cpu_used_cpu_user_children",
        "User CPU seconds consumed by background processes.",
    ),
];
