//! sim-relay — relays simulation control calls to deployed worker processes.

pub mod config;
pub mod error;
pub mod install;
pub mod jobs;
pub mod message;
pub mod relay;
pub mod transport;
