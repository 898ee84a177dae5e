//! The per-worker connection protocol.
//!
//! One [`WorkerConnection`] is created for every local channel the acceptor
//! hands over. It reads the mandatory init call, deploys a worker job, waits
//! for the worker's handshake on the distributed transport and then relays
//! call/reply pairs until the controller stops, either side fails, or the
//! remote job dies. However the connection ends, one cleanup sequence closes
//! both endpoints and cancels the job.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::error::ConnectionError;
use crate::jobs::{JobHandle, JobScheduler, WorkerDescription};
use crate::message::{CallMessage, Opcode};
use crate::relay::profile::{self, ProfileRecord};
use crate::transport::{ReceiveEndpoint, SendEndpoint, Transport};

/// One relayed worker connection.
///
/// Generic over the local channel so tests can drive the protocol through an
/// in-memory duplex stream.
pub struct WorkerConnection<C> {
    id: Uuid,
    channel: C,
    init_request: CallMessage,
    description: WorkerDescription,
    send: Box<dyn SendEndpoint>,
    recv: Box<dyn ReceiveEndpoint>,
    job: Arc<dyn JobHandle>,
    config: RelayConfig,
    /// Cleared the first time a read or write on the local channel fails;
    /// once cleared, no further replies are attempted.
    local_open: bool,
}

impl<C> WorkerConnection<C>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Accept a new local channel: read the init call, open both transport
    /// endpoints and submit the worker job.
    ///
    /// A first call that is not init rejects the connection outright; no job
    /// is submitted and there is nothing to clean up. The receive endpoint is
    /// opened before the job is submitted so the worker can never connect
    /// before the endpoint exists.
    pub async fn initialize(
        mut channel: C,
        transport: &dyn Transport,
        scheduler: &dyn JobScheduler,
        config: RelayConfig,
    ) -> Result<Self, ConnectionError> {
        let init_request = CallMessage::read_from(&mut channel).await?;
        if init_request.opcode != Opcode::Init {
            return Err(ConnectionError::ProtocolViolation {
                opcode: init_request.opcode,
            });
        }

        let id = Uuid::new_v4();
        let description = WorkerDescription::from_init(&init_request, id)
            .map_err(ConnectionError::Wire)?;

        let recv = transport.open_receive(&id.to_string()).await?;
        let send = transport.open_send().await?;

        let job = scheduler.submit(&description).await?;
        tracing::info!(
            id = %id,
            executable = %description.executable,
            node_label = description.node_label.as_deref().unwrap_or("-"),
            "worker job submitted"
        );

        Ok(Self {
            id,
            channel,
            init_request,
            description,
            send,
            recv,
            job,
            config,
            local_open: true,
        })
    }

    /// Start the connection as an independent task. Fire and forget; the
    /// task cleans up after itself on every exit path.
    pub fn spawn(self) {
        tokio::spawn(self.run());
    }

    /// Drive the connection to completion: deployment, handshake, relay
    /// loop, cleanup.
    pub async fn run(mut self) {
        match self.establish().await {
            Ok(install_root) => {
                let reply =
                    CallMessage::reply_to(&self.init_request).with_payload(install_root.into_bytes());
                match reply.write_to(&mut self.channel).await {
                    Ok(()) => {
                        tracing::info!(id = %self.id, "worker started");
                        self.forward().await;
                    }
                    Err(e) => {
                        self.local_open = false;
                        tracing::error!(id = %self.id, error = %e, "lost controller channel before worker startup completed");
                    }
                }
            }
            Err(e) => self.report_init_error(&e).await,
        }
        self.close().await;
    }

    /// Deployment and handshake: wait for the job to run, receive the
    /// worker's handshake, connect the send endpoint. Returns the remote
    /// installation root to be echoed to the controller.
    async fn establish(&mut self) -> Result<String, ConnectionError> {
        let startup_timeout = self.description.startup_timeout;
        self.job.wait_until_running(startup_timeout).await;
        if !self.job.is_running().await {
            return Err(ConnectionError::DeploymentTimeout {
                timeout: startup_timeout,
                state: self.job.state().await,
            });
        }

        let handshake = self
            .recv
            .recv_handshake(self.config.connect_timeout)
            .await
            .map_err(|e| ConnectionError::HandshakeFailure {
                reason: e.to_string(),
            })?;

        self.send
            .connect(&handshake.peer, self.config.connect_timeout)
            .await
            .map_err(|e| ConnectionError::HandshakeFailure {
                reason: e.to_string(),
            })?;

        tracing::debug!(id = %self.id, peer = %handshake.peer, "worker handshake complete");
        Ok(handshake.install_root)
    }

    /// Steady-state relay loop. One full call is answered before the next
    /// request is read; there is no pipelining within a connection.
    async fn forward(&mut self) {
        loop {
            let request = match CallMessage::read_from(&mut self.channel).await {
                Ok(request) => request,
                Err(e) => {
                    // A closed controller channel ends the connection; it is
                    // not an error anyone is left to hear about.
                    self.local_open = false;
                    tracing::info!(id = %self.id, reason = %e, "controller channel closed");
                    break;
                }
            };

            let stop = request.opcode == Opcode::Stop;

            match self.relay_call(&request).await {
                Ok(()) => {
                    if stop {
                        tracing::debug!(id = %self.id, "stop call completed");
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(id = %self.id, error = %e, call = request.call_id, "call relay failed");
                    if self.local_open {
                        let reply = CallMessage::error_reply(&request, format!("relay error: {e}"));
                        if let Err(e) = reply.write_to(&mut self.channel).await {
                            self.local_open = false;
                            tracing::error!(id = %self.id, error = %e, "could not return error reply to controller");
                        }
                    }
                    break;
                }
            }
        }
    }

    /// Relay one request to the worker and its reply back to the controller.
    async fn relay_call(&mut self, request: &CallMessage) -> Result<(), ConnectionError> {
        let started_at = Utc::now();
        let start = Instant::now();

        if self.job.is_done().await {
            return Err(ConnectionError::TransportLost {
                reason: "remote worker proxy no longer running".to_string(),
            });
        }

        self.send
            .send(request.to_frame())
            .await
            .map_err(|e| ConnectionError::TransportLost {
                reason: e.to_string(),
            })?;

        // Bounded poll instead of an indefinite block: every interval the
        // peer connection and the job are re-checked, so a dead worker is
        // noticed within one interval.
        let frame = loop {
            match self.recv.recv(self.config.poll_interval).await {
                Ok(Some(frame)) => break frame,
                Ok(None) => {}
                Err(e) => {
                    return Err(ConnectionError::TransportLost {
                        reason: e.to_string(),
                    });
                }
            }
            if self.recv.peer_count() == 0 || self.job.is_done().await {
                return Err(ConnectionError::TransportLost {
                    reason: "receive endpoint no longer connected to worker proxy, or job finished"
                        .to_string(),
                });
            }
        };

        let (reply, remote_elapsed) = CallMessage::reply_from_frame(&frame)?;

        if let Some(error) = reply.error() {
            // Application-level failure: not fatal, forwarded unchanged.
            tracing::warn!(id = %self.id, call = reply.call_id, %error, "worker reported call error");
        }

        if let Err(e) = reply.write_to(&mut self.channel).await {
            self.local_open = false;
            return Err(ConnectionError::Wire(e));
        }

        if profile::enabled() {
            let finished_at = Utc::now();
            ProfileRecord {
                connection_id: self.id,
                executable: &self.description.executable,
                opcode: request.opcode.to_wire(),
                call_id: request.call_id,
                request_size: request.data_size(),
                reply_size: reply.data_size(),
                started_at,
                finished_at,
                elapsed_us: start.elapsed().as_micros() as u64,
                remote_elapsed_us: remote_elapsed.as_micros() as u64,
            }
            .emit();
        }

        Ok(())
    }

    /// Best-effort error reply for failures before the relay loop, always
    /// correlated to the init call.
    async fn report_init_error(&mut self, error: &ConnectionError) {
        tracing::error!(id = %self.id, %error, "worker connection failed during startup");
        if !self.local_open {
            return;
        }
        let reply = CallMessage::error_reply(&self.init_request, format!("relay error: {error}"));
        if let Err(e) = reply.write_to(&mut self.channel).await {
            self.local_open = false;
            tracing::error!(id = %self.id, error = %e, "could not return error reply to controller");
        }
    }

    /// Terminal cleanup, reached exactly once on every path. The three steps
    /// are independent: a failure in one never skips the others.
    async fn close(mut self) {
        if let Err(e) = self.send.close().await {
            tracing::error!(id = %self.id, error = %e, "error closing send endpoint");
        }
        if let Err(e) = self.recv.close(self.config.receive_flush_timeout).await {
            tracing::error!(id = %self.id, error = %e, "error closing receive endpoint");
        }
        if let Err(e) = self.job.cancel().await {
            tracing::error!(id = %self.id, error = %e, "error cancelling worker job");
        }
        tracing::info!(id = %self.id, "worker connection ended");
    }
}
