//! Distributed transport abstraction.
//!
//! The relay talks to deployed workers through named send and receive
//! endpoints, one pair per connection. Any reliable, ordered, point-to-point
//! messaging layer can sit behind these traits; the in-process
//! [`local::LocalTransport`] backs same-host deployments and tests.

pub mod local;

pub use local::LocalTransport;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::TransportError;

/// The one-time message a worker sends after startup, before any call is
/// relayed.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Handshake {
    /// Name of the worker's own receive endpoint, for the relay to connect
    /// its send endpoint to.
    pub peer: String,
    /// Root directory of the remote installation.
    pub install_root: String,
}

/// Factory for named endpoints.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a receive endpoint under `name`.
    ///
    /// The endpoint accepts inbound peer connections from the moment this
    /// returns, so it can be opened before the worker that will connect to
    /// it is deployed.
    async fn open_receive(&self, name: &str) -> Result<Box<dyn ReceiveEndpoint>, TransportError>;

    /// Open an unconnected send endpoint.
    async fn open_send(&self) -> Result<Box<dyn SendEndpoint>, TransportError>;
}

/// Outbound half of an endpoint pair.
#[async_trait]
pub trait SendEndpoint: Send {
    /// Connect to the receive endpoint named `peer`. The peer may not exist
    /// yet; connecting retries until `timeout` expires.
    async fn connect(&mut self, peer: &str, timeout: Duration) -> Result<(), TransportError>;

    /// Send the startup handshake.
    async fn send_handshake(&mut self, handshake: &Handshake) -> Result<(), TransportError>;

    /// Send one complete logical message.
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Inbound half of an endpoint pair.
#[async_trait]
pub trait ReceiveEndpoint: Send {
    fn name(&self) -> &str;

    /// Wait for the worker's startup handshake, bounded by `timeout`.
    async fn recv_handshake(&mut self, timeout: Duration) -> Result<Handshake, TransportError>;

    /// Wait up to `timeout` for one message. `Ok(None)` means the wait timed
    /// out; callers are expected to re-check liveness and poll again.
    async fn recv(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError>;

    /// Number of peers currently connected to this endpoint.
    fn peer_count(&self) -> usize;

    /// Close the endpoint, waiting up to `flush_timeout` for in-flight
    /// messages to settle.
    async fn close(&mut self, flush_timeout: Duration) -> Result<(), TransportError>;
}
