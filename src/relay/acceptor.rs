//! Accepts local control channels and starts one connection task per
//! channel.

use std::sync::Arc;

use tokio::net::TcpListener;

use crate::config::RelayConfig;
use crate::error::Error;
use crate::jobs::JobScheduler;
use crate::relay::WorkerConnection;
use crate::transport::Transport;

/// Listens for controller connections and hands each one to an independent
/// [`WorkerConnection`] task.
pub struct ConnectionAcceptor {
    listener: TcpListener,
    transport: Arc<dyn Transport>,
    scheduler: Arc<dyn JobScheduler>,
    config: RelayConfig,
}

impl ConnectionAcceptor {
    /// Bind the configured listen address.
    pub async fn bind(
        config: RelayConfig,
        transport: Arc<dyn Transport>,
        scheduler: Arc<dyn JobScheduler>,
    ) -> Result<Self, Error> {
        let listener = TcpListener::bind(&config.listen_addr).await?;
        Ok(Self {
            listener,
            transport,
            scheduler,
            config,
        })
    }

    /// Address the acceptor is actually bound to.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop. Each accepted channel gets a fire-and-forget task that
    /// owns the whole connection lifecycle; nothing is joined.
    pub async fn run(self) -> Result<(), Error> {
        tracing::info!(addr = %self.listener.local_addr()?, "accepting worker connections");
        loop {
            let (stream, peer) = self.listener.accept().await?;
            tracing::debug!(%peer, "new controller channel");

            let transport = Arc::clone(&self.transport);
            let scheduler = Arc::clone(&self.scheduler);
            let config = self.config.clone();
            tokio::spawn(async move {
                match WorkerConnection::initialize(
                    stream,
                    transport.as_ref(),
                    scheduler.as_ref(),
                    config,
                )
                .await
                {
                    Ok(connection) => connection.run().await,
                    Err(e) => tracing::error!(%peer, error = %e, "rejected worker connection"),
                }
            });
        }
    }
}
