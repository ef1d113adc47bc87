use super::{Field, gauge};

pub(crate) const FIELDS: &[Field] = &[
    gauge(
        "connected_clients",
        "redis_clients_connected_clients",
        "Client connections, excluding replicas.",
    ),
    gauge(
        "client_recent_max_input_buffer",
        "redis_clients_client_recent_max_input_buffer",
        "Largest input buffer among current client connections.",
    )
    .or("client_biggest_input_buf"),
    gauge(
        "client_recent_max_output_buffer",
        "redis_clients_client_recent_max_output_buffer",
        "Largest output buffer among current client connections.",
    )
    .or("client_longest_output_list"),
    gauge(
        "blocked_clients",
        "redis_clients_blocked_clients",
        "Clients pending on a blocking call.",
    ),
];
