//! In-process transport backed by tokio channels.
//!
//! Endpoints live in a shared registry keyed by name. Suitable for workers
//! deployed on the relay host and for tests; remote deployments substitute a
//! networked implementation of the same traits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, timeout};

use crate::error::TransportError;
use crate::transport::{Handshake, ReceiveEndpoint, SendEndpoint, Transport};

/// Polling interval while waiting for a peer endpoint to appear.
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(20);

enum Frame {
    Handshake(Handshake),
    Data(Vec<u8>),
}

struct Mailbox {
    tx: mpsc::UnboundedSender<Frame>,
    peers: Arc<AtomicUsize>,
}

type Registry = Arc<Mutex<HashMap<String, Mailbox>>>;

/// Transport whose endpoints exchange messages through in-process channels.
#[derive(Clone, Default)]
pub struct LocalTransport {
    registry: Registry,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, name: &str) -> Option<(mpsc::UnboundedSender<Frame>, Arc<AtomicUsize>)> {
        let registry = self.registry.lock().expect("transport registry poisoned");
        registry
            .get(name)
            .map(|mailbox| (mailbox.tx.clone(), Arc::clone(&mailbox.peers)))
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn open_receive(&self, name: &str) -> Result<Box<dyn ReceiveEndpoint>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let peers = Arc::new(AtomicUsize::new(0));

        let mut registry = self.registry.lock().expect("transport registry poisoned");
        registry.insert(
            name.to_string(),
            Mailbox {
                tx,
                peers: Arc::clone(&peers),
            },
        );

        Ok(Box::new(LocalReceiveEndpoint {
            name: name.to_string(),
            rx,
            peers,
            registry: Arc::clone(&self.registry),
        }))
    }

    async fn open_send(&self) -> Result<Box<dyn SendEndpoint>, TransportError> {
        Ok(Box::new(LocalSendEndpoint {
            transport: self.clone(),
            connected: None,
        }))
    }
}

struct Connected {
    tx: mpsc::UnboundedSender<Frame>,
    peers: Arc<AtomicUsize>,
}

struct LocalSendEndpoint {
    transport: LocalTransport,
    connected: Option<Connected>,
}

impl LocalSendEndpoint {
    fn peer(&self) -> Result<&Connected, TransportError> {
        self.connected.as_ref().ok_or(TransportError::NotConnected)
    }

    fn push(&self, frame: Frame) -> Result<(), TransportError> {
        self.peer()?
            .tx
            .send(frame)
            .map_err(|_| TransportError::Closed)
    }

    fn disconnect(&mut self) {
        if let Some(connected) = self.connected.take() {
            connected.peers.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl SendEndpoint for LocalSendEndpoint {
    async fn connect(&mut self, peer: &str, timeout: Duration) -> Result<(), TransportError> {
        self.disconnect();

        // The peer endpoint may still be starting up; retry until the
        // deadline passes.
        let deadline = Instant::now() + timeout;
        loop {
            if let Some((tx, peers)) = self.transport.lookup(peer) {
                peers.fetch_add(1, Ordering::SeqCst);
                self.connected = Some(Connected { tx, peers });
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(TransportError::ConnectTimeout {
                    peer: peer.to_string(),
                    timeout,
                });
            }
            sleep(CONNECT_RETRY_INTERVAL).await;
        }
    }

    async fn send_handshake(&mut self, handshake: &Handshake) -> Result<(), TransportError> {
        self.push(Frame::Handshake(handshake.clone()))
    }

    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.push(Frame::Data(frame))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.disconnect();
        Ok(())
    }
}

impl Drop for LocalSendEndpoint {
    fn drop(&mut self) {
        self.disconnect();
    }
}

struct LocalReceiveEndpoint {
    name: String,
    rx: mpsc::UnboundedReceiver<Frame>,
    peers: Arc<AtomicUsize>,
    registry: Registry,
}

#[async_trait]
impl ReceiveEndpoint for LocalReceiveEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    async fn recv_handshake(&mut self, wait: Duration) -> Result<Handshake, TransportError> {
        match timeout(wait, self.rx.recv()).await {
            Ok(Some(Frame::Handshake(handshake))) => Ok(handshake),
            Ok(Some(Frame::Data(_))) => Err(TransportError::Malformed(
                "data frame received where handshake expected".to_string(),
            )),
            Ok(None) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::HandshakeTimeout { timeout: wait }),
        }
    }

    async fn recv(&mut self, wait: Duration) -> Result<Option<Vec<u8>>, TransportError> {
        match timeout(wait, self.rx.recv()).await {
            Ok(Some(Frame::Data(frame))) => Ok(Some(frame)),
            Ok(Some(Frame::Handshake(_))) => Err(TransportError::Malformed(
                "unexpected handshake after connection setup".to_string(),
            )),
            Ok(None) => Err(TransportError::Closed),
            Err(_) => Ok(None),
        }
    }

    fn peer_count(&self) -> usize {
        self.peers.load(Ordering::SeqCst)
    }

    async fn close(&mut self, _flush_timeout: Duration) -> Result<(), TransportError> {
        let mut registry = self.registry.lock().expect("transport registry poisoned");
        registry.remove(&self.name);
        Ok(())
    }
}

impl Drop for LocalReceiveEndpoint {
    fn drop(&mut self) {
        if let Ok(mut registry) = self.registry.lock() {
            registry.remove(&self.name);
        }
    }
}
