//! The worker connection protocol and its surroundings.

pub mod acceptor;
pub mod connection;
pub mod profile;

pub use acceptor::ConnectionAcceptor;
pub use connection::WorkerConnection;
