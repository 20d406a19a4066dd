//! In-process pipe transport.
//!
//! Every stream is a pair of bounded tokio channels, one per direction.
//! Opening or pushing a stream hands the far half to the peer connection's
//! accept queue together with its headers.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::error::{TransportError, TransportResult};
use crate::session::{Session, SessionConfig};
use crate::transport::{Connection, FrameStream, InboundStream, TransportStats};
use crate::wire::headers::StreamHeaders;
use crate::wire::types::Role;

pub const DEFAULT_FRAME_CAPACITY: usize = 1024;

/// Configuration for the in-memory transport.
#[derive(Clone, Debug)]
pub struct MemoryConfig {
    /// Frames buffered per direction before `send_frame` waits.
    pub frame_capacity: usize,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    /// When disabled, streams behave like a transport without server push.
    pub push_enabled: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            frame_capacity: DEFAULT_FRAME_CAPACITY,
            read_timeout: None,
            write_timeout: Some(Duration::from_secs(5)),
            push_enabled: true,
        }
    }
}

impl MemoryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_frame_capacity(mut self, capacity: usize) -> Self {
        self.frame_capacity = capacity.max(1);
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    pub fn with_push(mut self, enabled: bool) -> Self {
        self.push_enabled = enabled;
        self
    }
}

/// Accept queues of both ends of a connection, from one end's point of view.
#[derive(Clone, Debug)]
struct Link {
    local: mpsc::UnboundedSender<InboundStream>,
    peer: mpsc::UnboundedSender<InboundStream>,
}

impl Link {
    fn reversed(&self) -> Self {
        Self {
            local: self.peer.clone(),
            peer: self.local.clone(),
        }
    }

    /// Create a stream pair and deliver the far half to the peer.
    fn open(
        &self,
        name: &str,
        headers: StreamHeaders,
        config: &MemoryConfig,
    ) -> TransportResult<MemoryStream> {
        let (near, far) = MemoryStream::pair(name, self, config);
        self.peer
            .send(InboundStream {
                headers,
                stream: Box::new(far),
            })
            .map_err(|_| TransportError::NotConnected)?;
        Ok(near)
    }
}

/// One half of an in-memory duplex stream.
pub struct MemoryStream {
    sender: Mutex<Option<mpsc::Sender<Bytes>>>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    shutdown: watch::Sender<bool>,
    link: Link,
    config: MemoryConfig,
    stats: Arc<Mutex<TransportStats>>,
    name: String,
}

impl MemoryStream {
    fn pair(name: &str, link: &Link, config: &MemoryConfig) -> (Self, Self) {
        let (tx1, rx1) = mpsc::channel(config.frame_capacity);
        let (tx2, rx2) = mpsc::channel(config.frame_capacity);

        let near = Self {
            sender: Mutex::new(Some(tx1)),
            receiver: tokio::sync::Mutex::new(rx2),
            shutdown: watch::Sender::new(false),
            link: link.clone(),
            config: config.clone(),
            stats: Arc::new(Mutex::new(TransportStats::default())),
            name: format!("{}-near", name),
        };

        let far = Self {
            sender: Mutex::new(Some(tx2)),
            receiver: tokio::sync::Mutex::new(rx1),
            shutdown: watch::Sender::new(false),
            link: link.reversed(),
            config: config.clone(),
            stats: Arc::new(Mutex::new(TransportStats::default())),
            name: format!("{}-far", name),
        };

        (near, far)
    }

    /// Whether our sending side has been closed.
    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }
}

async fn with_timeout<T>(
    timeout: Option<Duration>,
    operation: &str,
    fut: impl Future<Output = T>,
) -> TransportResult<T> {
    match timeout {
        Some(duration) => tokio::time::timeout(duration, fut).await.map_err(|_| {
            TransportError::Timeout {
                duration_ms: duration.as_millis() as u64,
                operation: operation.to_string(),
            }
        }),
        None => Ok(fut.await),
    }
}

#[async_trait]
impl FrameStream for MemoryStream {
    async fn send_frame(&self, data: &[u8]) -> TransportResult<()> {
        let sender = self.sender.lock().clone().ok_or(TransportError::Closed)?;
        let bytes = Bytes::copy_from_slice(data);

        let result = with_timeout(self.config.write_timeout, "send", sender.send(bytes))
            .await
            .and_then(|sent| {
                sent.map_err(|_| TransportError::SendFailed {
                    attempts: 1,
                    reason: "Stream closed by peer".into(),
                })
            });

        let mut stats = self.stats.lock();
        match result {
            Ok(()) => {
                stats.messages_sent += 1;
                stats.bytes_sent += data.len() as u64;
            }
            Err(_) => stats.send_errors += 1,
        }

        result
    }

    async fn recv_frame(&self) -> TransportResult<Option<Bytes>> {
        let mut receiver = self.receiver.lock().await;
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            receiver.close();
            return Ok(None);
        }

        let next = async {
            tokio::select! {
                frame = receiver.recv() => frame,
                _ = async { let _ = shutdown.wait_for(|closed| *closed).await; } => None,
            }
        };
        let frame = match with_timeout(self.config.read_timeout, "receive", next).await {
            Ok(frame) => frame,
            Err(err) => {
                self.stats.lock().recv_errors += 1;
                return Err(err);
            }
        };

        match &frame {
            Some(bytes) => {
                let mut stats = self.stats.lock();
                stats.messages_received += 1;
                stats.bytes_received += bytes.len() as u64;
            }
            None if *self.shutdown.borrow() => receiver.close(),
            None => {}
        }

        Ok(frame)
    }

    async fn close(&self) -> TransportResult<()> {
        self.sender.lock().take();
        self.shutdown.send_replace(true);
        // A reader in flight closes the receiver itself once it wakes up.
        if let Ok(mut receiver) = self.receiver.try_lock() {
            receiver.close();
        }
        Ok(())
    }

    fn supports_push(&self) -> bool {
        self.config.push_enabled
    }

    async fn push(&self, headers: StreamHeaders) -> TransportResult<Box<dyn FrameStream>> {
        if !self.config.push_enabled {
            return Err(TransportError::PushUnsupported(self.name.clone()));
        }
        if self.is_closed() {
            return Err(TransportError::PushFailed(format!(
                "{} is closed",
                self.name
            )));
        }

        let child = self
            .link
            .open(&format!("{}-push", self.name), headers, &self.config)
            .map_err(|e| TransportError::PushFailed(e.to_string()))?;
        self.stats.lock().streams_pushed += 1;
        Ok(Box::new(child))
    }

    fn stats(&self) -> Option<TransportStats> {
        Some(self.stats.lock().clone())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for MemoryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStream")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// One end of an in-memory connection.
pub struct MemoryConnection {
    link: Link,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundStream>>,
    config: MemoryConfig,
    name: String,
}

/// Create a pair of connected in-memory connections.
pub fn pair(name: impl Into<String>, config: MemoryConfig) -> (MemoryConnection, MemoryConnection) {
    let name = name.into();
    let (tx1, rx1) = mpsc::unbounded_channel();
    let (tx2, rx2) = mpsc::unbounded_channel();

    let link = Link {
        local: tx1,
        peer: tx2,
    };

    let c1 = MemoryConnection {
        link: link.clone(),
        incoming: tokio::sync::Mutex::new(rx1),
        config: config.clone(),
        name: format!("{}-acceptor", name),
    };

    let c2 = MemoryConnection {
        link: link.reversed(),
        incoming: tokio::sync::Mutex::new(rx2),
        config,
        name: format!("{}-initiator", name),
    };

    (c1, c2)
}

/// Two sessions already connected to each other and accepting streams.
///
/// The first session is the acceptor, the second the initiator; `config`'s
/// role is overridden accordingly.
pub fn session_pair(config: SessionConfig, transport: MemoryConfig) -> (Session, Session) {
    let (c1, c2) = pair("memory", transport);
    let acceptor = Session::connect(Arc::new(c1), config.clone().with_role(Role::Acceptor));
    let initiator = Session::connect(Arc::new(c2), config.with_role(Role::Initiator));
    (acceptor, initiator)
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn open_stream(&self, headers: StreamHeaders) -> TransportResult<Box<dyn FrameStream>> {
        let stream = self.link.open(&self.name, headers, &self.config)?;
        Ok(Box::new(stream))
    }

    async fn accept_stream(&self) -> TransportResult<Option<InboundStream>> {
        Ok(self.incoming.lock().await.recv().await)
    }

    async fn close(&self) -> TransportResult<()> {
        self.incoming.lock().await.close();
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}
