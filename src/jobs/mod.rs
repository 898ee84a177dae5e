//! Job submission collaborator — deploys worker processes and tracks their
//! lifecycle.
//!
//! The relay only drives jobs through the [`JobScheduler`] and [`JobHandle`]
//! seams; placement policy and the actual deployment machinery live behind
//! them. [`local::LocalScheduler`] runs workers as child processes on the
//! relay host.

pub mod local;

pub use local::LocalScheduler;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{JobError, WireError};
use crate::message::CallMessage;

/// Lifecycle state of a deployed worker job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum JobState {
    Submitted,
    Running,
    Done,
    Cancelled,
    Failed,
}

impl JobState {
    /// Whether the job has reached a terminal state.
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobState::Submitted | JobState::Running)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Submitted => "submitted",
            JobState::Running => "running",
            JobState::Done => "done",
            JobState::Cancelled => "cancelled",
            JobState::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// Handle to one deployed worker job.
#[async_trait]
pub trait JobHandle: Send + Sync {
    /// Wait until the job leaves `Submitted`, but no longer than `timeout`.
    /// Callers check [`JobHandle::is_running`] afterwards.
    async fn wait_until_running(&self, timeout: Duration);

    async fn state(&self) -> JobState;

    async fn is_running(&self) -> bool {
        self.state().await == JobState::Running
    }

    async fn is_done(&self) -> bool {
        self.state().await.is_terminal()
    }

    /// Cancel the job. The owning connection calls this at most once.
    async fn cancel(&self) -> Result<(), JobError>;
}

/// Deploys worker jobs. Shared by every connection task, so implementations
/// must be safe under concurrent submission.
#[async_trait]
pub trait JobScheduler: Send + Sync {
    async fn submit(
        &self,
        description: &WorkerDescription,
    ) -> Result<Arc<dyn JobHandle>, JobError>;
}

/// Description of one worker deployment, derived from the init call plus a
/// freshly generated connection id. Immutable after creation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerDescription {
    /// Globally unique connection id; also names both transport endpoints.
    pub id: Uuid,
    /// Worker code executable.
    pub executable: String,
    /// Node-placement label, if the controller requested one.
    pub node_label: Option<String>,
    /// Number of worker processes.
    pub worker_count: u32,
    /// Threads per worker process.
    pub threads_per_worker: u32,
    /// How long deployment may take before the connection gives up.
    pub startup_timeout: Duration,
}

impl WorkerDescription {
    /// Build a description from the payload of an init call.
    pub fn from_init(request: &CallMessage, id: Uuid) -> Result<Self, WireError> {
        let mut cursor = PayloadCursor::new(&request.payload);
        let executable = cursor.string("executable")?;
        let node_label = cursor.string("node label")?;
        let worker_count = cursor.u32("worker count")?;
        let threads_per_worker = cursor.u32("threads per worker")?;
        let startup_timeout = Duration::from_secs(u64::from(cursor.u32("startup timeout")?));

        if executable.is_empty() {
            return Err(WireError::MalformedInit("empty executable".to_string()));
        }

        Ok(Self {
            id,
            executable,
            node_label: (!node_label.is_empty()).then_some(node_label),
            worker_count,
            threads_per_worker,
            startup_timeout,
        })
    }
}

/// Encode the payload of an init call. The inverse of
/// [`WorkerDescription::from_init`], used by controllers and tests.
pub fn encode_init_payload(
    executable: &str,
    node_label: Option<&str>,
    worker_count: u32,
    threads_per_worker: u32,
    startup_timeout: Duration,
) -> Vec<u8> {
    let label = node_label.unwrap_or("");
    let mut payload = Vec::new();
    payload.extend_from_slice(&(executable.len() as u32).to_be_bytes());
    payload.extend_from_slice(executable.as_bytes());
    payload.extend_from_slice(&(label.len() as u32).to_be_bytes());
    payload.extend_from_slice(label.as_bytes());
    payload.extend_from_slice(&worker_count.to_be_bytes());
    payload.extend_from_slice(&threads_per_worker.to_be_bytes());
    payload.extend_from_slice(&(startup_timeout.as_secs() as u32).to_be_bytes());
    payload
}

struct PayloadCursor<'a> {
    bytes: &'a [u8],
}

impl<'a> PayloadCursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn u32(&mut self, field: &str) -> Result<u32, WireError> {
        if self.bytes.len() < 4 {
            return Err(WireError::MalformedInit(format!("missing {field}")));
        }
        let value = u32::from_be_bytes(self.bytes[..4].try_into().expect("checked length"));
        self.bytes = &self.bytes[4..];
        Ok(value)
    }

    fn string(&mut self, field: &str) -> Result<String, WireError> {
        let len = self.u32(field)? as usize;
        if self.bytes.len() < len {
            return Err(WireError::MalformedInit(format!("truncated {field}")));
        }
        let value = String::from_utf8(self.bytes[..len].to_vec())
            .map_err(|_| WireError::MalformedInit(format!("{field} is not UTF-8")))?;
        self.bytes = &self.bytes[len..];
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Opcode;

    fn init_message(payload: Vec<u8>) -> CallMessage {
        CallMessage::new(Opcode::Init, 1, 1).with_payload(payload)
    }

    #[test]
    fn description_round_trip() {
        let payload = encode_init_payload(
            "bin/gravity_worker",
            Some("gpu-node"),
            4,
            8,
            Duration::from_secs(120),
        );
        let id = Uuid::new_v4();
        let description = WorkerDescription::from_init(&init_message(payload), id).unwrap();

        assert_eq!(description.id, id);
        assert_eq!(description.executable, "bin/gravity_worker");
        assert_eq!(description.node_label.as_deref(), Some("gpu-node"));
        assert_eq!(description.worker_count, 4);
        assert_eq!(description.threads_per_worker, 8);
        assert_eq!(description.startup_timeout, Duration::from_secs(120));
    }

    #[test]
    fn empty_label_becomes_none() {
        let payload = encode_init_payload("worker", None, 1, 1, Duration::from_secs(5));
        let description =
            WorkerDescription::from_init(&init_message(payload), Uuid::new_v4()).unwrap();
        assert_eq!(description.node_label, None);
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let mut payload = encode_init_payload("worker", None, 1, 1, Duration::from_secs(5));
        payload.truncate(payload.len() - 2);
        assert!(matches!(
            WorkerDescription::from_init(&init_message(payload), Uuid::new_v4()),
            Err(WireError::MalformedInit(_))
        ));
    }

    #[test]
    fn empty_executable_is_rejected() {
        let payload = encode_init_payload("", None, 1, 1, Duration::from_secs(5));
        assert!(matches!(
            WorkerDescription::from_init(&init_message(payload), Uuid::new_v4()),
            Err(WireError::MalformedInit(_))
        ));
    }

    #[test]
    fn terminal_states() {
        assert!(!JobState::Submitted.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Done.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(JobState::Failed.is_terminal());
    }
}
