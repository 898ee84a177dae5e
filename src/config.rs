//! Configuration types.

use std::time::Duration;

/// Relay configuration, shared by every connection.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address the connection acceptor listens on.
    pub listen_addr: String,
    /// Timeout for the worker handshake and the send-endpoint connect.
    pub connect_timeout: Duration,
    /// Poll interval of the reply wait loop; bounds how long a dead worker
    /// can go unnoticed mid-call.
    pub poll_interval: Duration,
    /// Flush wait when closing the receive endpoint.
    pub receive_flush_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:6950".to_string(),
            connect_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            receive_flush_timeout: Duration::from_secs(1),
        }
    }
}
