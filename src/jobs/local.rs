//! Local job scheduler — runs workers as child processes on the relay host.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::{oneshot, watch};

use crate::error::JobError;
use crate::jobs::{JobHandle, JobScheduler, JobState, WorkerDescription};

/// Scheduler that spawns worker executables directly.
///
/// Relative executables resolve against the installation home when one is
/// configured.
pub struct LocalScheduler {
    home: Option<PathBuf>,
}

impl LocalScheduler {
    pub fn new(home: Option<PathBuf>) -> Self {
        Self { home }
    }

    fn resolve(&self, executable: &str) -> PathBuf {
        let path = PathBuf::from(executable);
        match (&self.home, path.is_relative()) {
            (Some(home), true) => home.join(path),
            _ => path,
        }
    }
}

#[async_trait]
impl JobScheduler for LocalScheduler {
    async fn submit(
        &self,
        description: &WorkerDescription,
    ) -> Result<Arc<dyn JobHandle>, JobError> {
        let executable = self.resolve(&description.executable);

        let mut child = Command::new(&executable)
            .arg("--connection-id")
            .arg(description.id.to_string())
            .arg("--workers")
            .arg(description.worker_count.to_string())
            .arg("--threads")
            .arg(description.threads_per_worker.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| JobError::Spawn {
                executable: executable.display().to_string(),
                source,
            })?;

        let (state_tx, state_rx) = watch::channel(JobState::Submitted);
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();

        // The process exists, so the job is running from here on.
        let _ = state_tx.send(JobState::Running);

        let id = description.id;
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let next = match status {
                        Ok(status) if status.success() => JobState::Done,
                        Ok(status) => {
                            tracing::warn!(job = %id, %status, "worker process exited abnormally");
                            JobState::Failed
                        }
                        Err(e) => {
                            tracing::warn!(job = %id, error = %e, "failed waiting on worker process");
                            JobState::Failed
                        }
                    };
                    let _ = state_tx.send(next);
                }
                cancelled = &mut cancel_rx => {
                    if cancelled.is_ok() {
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                        let _ = state_tx.send(JobState::Cancelled);
                    } else {
                        // Handle dropped without a cancel; keep waiting for
                        // the process itself.
                        let next = match child.wait().await {
                            Ok(status) if status.success() => JobState::Done,
                            _ => JobState::Failed,
                        };
                        let _ = state_tx.send(next);
                    }
                }
            }
        });

        Ok(Arc::new(LocalJob {
            state_rx,
            cancel_tx: Mutex::new(Some(cancel_tx)),
        }))
    }
}

struct LocalJob {
    state_rx: watch::Receiver<JobState>,
    cancel_tx: Mutex<Option<oneshot::Sender<()>>>,
}

#[async_trait]
impl JobHandle for LocalJob {
    async fn wait_until_running(&self, timeout: Duration) {
        let mut rx = self.state_rx.clone();
        let _ = tokio::time::timeout(timeout, async {
            loop {
                if *rx.borrow() != JobState::Submitted {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await;
    }

    async fn state(&self) -> JobState {
        *self.state_rx.borrow()
    }

    async fn cancel(&self) -> Result<(), JobError> {
        let tx = self
            .cancel_tx
            .lock()
            .expect("cancel sender lock poisoned")
            .take();
        if let Some(tx) = tx {
            // A send failure means the monitor already observed the process
            // exit; the job is terminal either way.
            let _ = tx.send(());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use uuid::Uuid;

    /// Write an executable script that ignores the worker arguments, so the
    /// scheduler can be tested without a real worker binary.
    fn script(dir: &tempfile::TempDir, name: &str, body: &str) -> String {
        let path = dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    fn description(executable: &str) -> WorkerDescription {
        WorkerDescription {
            id: Uuid::new_v4(),
            executable: executable.to_string(),
            node_label: None,
            worker_count: 1,
            threads_per_worker: 1,
            startup_timeout: Duration::from_secs(5),
        }
    }

    async fn wait_for_state(handle: &Arc<dyn JobHandle>, expected: JobState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if handle.state().await == expected {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("job never reached state {expected}"));
    }

    #[tokio::test]
    async fn spawned_job_runs_and_cancels() {
        let dir = tempfile::tempdir().unwrap();
        let worker = script(&dir, "worker.sh", "exec sleep 30");
        let scheduler = LocalScheduler::new(None);
        let handle = scheduler.submit(&description(&worker)).await.unwrap();

        handle.wait_until_running(Duration::from_secs(2)).await;
        assert!(handle.is_running().await);
        assert!(!handle.is_done().await);

        handle.cancel().await.unwrap();
        wait_for_state(&handle, JobState::Cancelled).await;
        assert!(handle.is_done().await);
    }

    #[tokio::test]
    async fn short_lived_job_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let worker = script(&dir, "worker.sh", "exit 0");
        let scheduler = LocalScheduler::new(None);
        let handle = scheduler.submit(&description(&worker)).await.unwrap();
        wait_for_state(&handle, JobState::Done).await;
    }

    #[tokio::test]
    async fn failing_job_is_reported_failed() {
        let dir = tempfile::tempdir().unwrap();
        let worker = script(&dir, "worker.sh", "exit 3");
        let scheduler = LocalScheduler::new(None);
        let handle = scheduler.submit(&description(&worker)).await.unwrap();
        wait_for_state(&handle, JobState::Failed).await;
    }

    #[tokio::test]
    async fn relative_executable_resolves_against_home() {
        let dir = tempfile::tempdir().unwrap();
        script(&dir, "worker.sh", "exit 0");
        let scheduler = LocalScheduler::new(Some(dir.path().to_path_buf()));
        let handle = scheduler.submit(&description("worker.sh")).await.unwrap();
        wait_for_state(&handle, JobState::Done).await;
    }

    #[tokio::test]
    async fn missing_executable_fails_submission() {
        let scheduler = LocalScheduler::new(None);
        let result = scheduler
            .submit(&description("/no/such/worker/executable"))
            .await;
        assert!(matches!(result, Err(JobError::Spawn { .. })));
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let worker = script(&dir, "worker.sh", "exec sleep 30");
        let scheduler = LocalScheduler::new(None);
        let handle = scheduler.submit(&description(&worker)).await.unwrap();
        handle.cancel().await.unwrap();
        handle.cancel().await.unwrap();
        wait_for_state(&handle, JobState::Cancelled).await;
    }
}
