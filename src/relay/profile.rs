//! Per-call profiling records.
//!
//! One record per completed call, emitted as a JSON line on a dedicated
//! trace target. Nothing is collected unless a sink subscribes to that
//! target at trace level.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Tracing target the profiling stream is emitted on.
pub const PROFILE_TARGET: &str = "sim_relay::profile";

/// Whether any active sink collects the profiling stream.
pub fn enabled() -> bool {
    tracing::enabled!(target: PROFILE_TARGET, tracing::Level::TRACE)
}

/// Timing and size data of one completed call.
#[derive(Debug, serde::Serialize)]
pub struct ProfileRecord<'a> {
    pub connection_id: Uuid,
    pub executable: &'a str,
    pub opcode: u32,
    pub call_id: u32,
    pub request_size: usize,
    pub reply_size: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Wall-clock time the call spent in the relay, microseconds.
    pub elapsed_us: u64,
    /// Execution time reported by the remote worker, microseconds.
    pub remote_elapsed_us: u64,
}

impl ProfileRecord<'_> {
    pub fn emit(&self) {
        match serde_json::to_string(self) {
            Ok(record) => tracing::trace!(target: PROFILE_TARGET, %record),
            Err(e) => tracing::warn!(error = %e, "failed to serialize profile record"),
        }
    }
}
