//! The multiplexing context for one connection.
//!
//! A session owns id allocation and the channel tables, reconciles decoded
//! channel references with transport streams arriving from the peer, and
//! tears everything down on `close`.

pub mod config;
pub(crate) mod registry;

pub use config::SessionConfig;

use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, trace, warn};

use self::registry::{Admission, Registry};
use crate::channel::endpoint::EndpointCore;
use crate::channel::{ByteStream, Channel};
use crate::codec::Encoder;
use crate::error::{ChanError, Result, TransportError};
use crate::transport::{Connection, FrameStream, InboundStream};
use crate::wire::headers::StreamHeaders;
use crate::wire::types::{ChannelId, ChannelIdAllocator, Direction, EndpointKind};

/// Notifications published by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A protocol error, or a channel error nobody was waiting for.
    Error(ChanError),
    /// A channel reached its terminal state. Sent once per channel.
    ChannelClosed(ChannelId),
    /// The session finished closing, with the first close error if any.
    Closed(Option<ChanError>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closing,
    Closed,
}

pub(crate) struct SessionShared {
    config: SessionConfig,
    ids: ChannelIdAllocator,
    registry: Mutex<Registry>,
    connection: Option<Arc<dyn Connection>>,
    /// Ids of offered top-level streams, in arrival order.
    offered_tx: Mutex<Option<mpsc::UnboundedSender<ChannelId>>>,
    offered_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ChannelId>>,
    events: broadcast::Sender<SessionEvent>,
    state: watch::Sender<SessionState>,
}

impl SessionShared {
    /// Publish an error on the session.
    pub(crate) fn report(&self, err: ChanError) {
        warn!(error = %err, "session error");
        let _ = self.events.send(SessionEvent::Error(err));
    }

    /// Called once per endpoint when it reaches `Closed`.
    pub(crate) fn retire(&self, id: ChannelId) {
        let removed = self.registry.lock().retire(id);
        if removed {
            let _ = self.events.send(SessionEvent::ChannelClosed(id));
        }
    }

    pub(crate) fn register_decoded(&self, decoded: Vec<Arc<EndpointCore>>) -> Result<()> {
        if decoded.is_empty() {
            return Ok(());
        }
        if let Some(foreign) = decoded.iter().find(|core| !core.belongs_to(self)) {
            return Err(ChanError::ForeignChannel(foreign.id()));
        }
        let count = decoded.len();
        self.registry.lock().register_decoded(decoded, &self.ids)?;
        trace!(count, "registered decoded references");
        Ok(())
    }
}

impl std::fmt::Debug for SessionShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionShared")
            .field("config", &self.config)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

/// Handle to a session. Clones share the same session.
#[derive(Clone, Debug)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    fn new(connection: Option<Arc<dyn Connection>>, config: SessionConfig) -> Self {
        let (offered_tx, offered_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        Self {
            shared: Arc::new(SessionShared {
                ids: ChannelIdAllocator::new(config.role),
                config,
                registry: Mutex::new(Registry::default()),
                connection,
                offered_tx: Mutex::new(Some(offered_tx)),
                offered_rx: tokio::sync::Mutex::new(offered_rx),
                events,
                state: watch::Sender::new(SessionState::Open),
            }),
        }
    }

    /// Start a session over `connection` and accept the peer's streams in
    /// the background. Must be called from within a tokio runtime.
    pub fn connect(connection: Arc<dyn Connection>, config: SessionConfig) -> Self {
        let session = Self::new(Some(connection.clone()), config);
        debug!(connection = connection.name(), role = ?session.shared.config.role, "session started");
        spawn_accept_loop(Arc::downgrade(&session.shared), connection);
        session
    }

    /// A session without a connection. Streams are supplied by hand through
    /// [`Session::on_inbound_stream`] and [`Channel::handle`].
    pub fn detached(config: SessionConfig) -> Self {
        Self::new(None, config)
    }

    pub(crate) fn from_shared(shared: Arc<SessionShared>) -> Self {
        Self { shared }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn encoder(&self) -> Encoder {
        Encoder::new(Arc::downgrade(&self.shared))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Create a message channel, optionally as a child of `parent`.
    ///
    /// A child is established through the parent's stream: pushed when the
    /// transport can push, otherwise opened as a fresh stream naming the
    /// parent. On a connected session a top-level endpoint opens its own
    /// stream; the peer either accepts it or binds it to a reference it
    /// decodes. A detached session leaves top-level endpoints unbound until
    /// [`Channel::handle`].
    pub fn create_channel(&self, direction: Direction, parent: Option<&Channel>) -> Result<Channel> {
        let core = self.create_endpoint(EndpointKind::Channel(direction), parent.map(Channel::core))?;
        Ok(Channel::from_core(core, direction))
    }

    /// Create a byte stream, optionally as a child of `parent`.
    pub fn create_byte_stream(&self, parent: Option<&Channel>) -> Result<ByteStream> {
        let core = self.create_endpoint(EndpointKind::ByteStream, parent.map(Channel::core))?;
        Ok(ByteStream::from_core(core))
    }

    fn create_endpoint(
        &self,
        kind: EndpointKind,
        parent: Option<&Arc<EndpointCore>>,
    ) -> Result<Arc<EndpointCore>> {
        let core = {
            let mut registry = self.shared.registry.lock();
            if registry.closing {
                return Err(ChanError::SessionClosed);
            }
            let id = self.shared.ids.next()?;
            let core = EndpointCore::new(id, kind, Arc::downgrade(&self.shared));
            if let Some(parent) = parent {
                core.set_parent(parent.id(), Some(parent));
            }
            registry.channels.insert(id, core.clone());
            core
        };

        debug!(
            channel_id = %core.id(),
            kind = %kind,
            parent = ?parent.map(|p| p.id().raw()),
            "channel created"
        );

        let establish = parent.is_some() || self.shared.connection.is_some();
        if establish {
            tokio::spawn(establish_stream(
                core.clone(),
                parent.cloned(),
                self.shared.connection.clone(),
            ));
        }

        Ok(core)
    }

    /// Register a channel whose reference was decoded outside of
    /// [`Encoder::decode`], which already does this itself.
    ///
    /// Binds it to a stream the peer already sent for its id, otherwise
    /// keeps it until that stream arrives.
    pub fn on_channel_decoded(&self, channel: &Channel) -> Result<()> {
        self.shared.register_decoded(vec![channel.core().clone()])
    }

    /// Byte stream counterpart of [`Session::on_channel_decoded`].
    pub fn on_byte_stream_decoded(&self, stream: &ByteStream) -> Result<()> {
        self.shared.register_decoded(vec![stream.core().clone()])
    }

    /// Take a stream opened or pushed by the peer.
    ///
    /// A stream for a known channel binds it. Any other stream is buffered:
    /// a child stream until a reference to its id is decoded, a top-level
    /// stream until either such a reference or [`Session::accept`] claims
    /// it. Rejected streams are closed and the error is also published as a
    /// session event.
    pub async fn on_inbound_stream(&self, headers: StreamHeaders, stream: Box<dyn FrameStream>) -> Result<()> {
        let admission = self
            .shared
            .registry
            .lock()
            .admit(InboundStream { headers, stream }, &self.shared.ids);

        match admission {
            Admission::Offered(id) => {
                debug!(channel_id = %id, "top-level stream offered");
                let sender = self.shared.offered_tx.lock().clone();
                if let Some(tx) = sender {
                    if tx.send(id).is_err() {
                        trace!(channel_id = %id, "session closing, offer dropped");
                    }
                }
                Ok(())
            }
            Admission::Bound(id) => {
                debug!(channel_id = %id, "inbound stream bound");
                Ok(())
            }
            Admission::Buffered(id) => {
                debug!(channel_id = %id, pending = self.pending_count(), "inbound stream buffered");
                Ok(())
            }
            Admission::Reject(err, stream) => {
                if let Err(close_err) = stream.close().await {
                    trace!(error = %close_err, "closing rejected stream failed");
                }
                self.shared.report(err.clone());
                Err(err)
            }
        }
    }

    /// Next top-level channel opened by the peer, as a read channel.
    /// Streams already claimed by a decoded reference are skipped. `None`
    /// once the session has closed.
    pub async fn accept(&self) -> Option<Channel> {
        let mut offered = self.shared.offered_rx.lock().await;
        while let Some(id) = offered.recv().await {
            let claimed = self
                .shared
                .registry
                .lock()
                .claim_root(id, &Arc::downgrade(&self.shared));
            match claimed {
                Some(core) => {
                    debug!(channel_id = %id, "top-level channel accepted");
                    return Some(Channel::from_core(core, Direction::Read));
                }
                None => trace!(channel_id = %id, "offered stream already claimed"),
            }
        }
        None
    }

    /// Force-close every channel, terminate every buffered stream, then
    /// close the connection. Returns the first channel close error; all
    /// channels are closed regardless.
    ///
    /// Later calls wait for the first one to finish and return `Ok`.
    pub async fn close(&self) -> Result<()> {
        let started = self.shared.state.send_if_modified(|state| {
            if *state == SessionState::Open {
                *state = SessionState::Closing;
                true
            } else {
                false
            }
        });
        if !started {
            self.closed().await;
            return Ok(());
        }

        let live: Vec<Arc<EndpointCore>> = {
            let mut registry = self.shared.registry.lock();
            registry.closing = true;
            registry.channels.values().cloned().collect()
        };
        debug!(channels = live.len(), "closing session");

        let results: Vec<Result<()>> = stream::iter(live)
            .map(|core| async move { core.shutdown(true).await })
            .buffer_unordered(self.shared.config.close_concurrency.max(1))
            .collect()
            .await;
        let first_error = results.into_iter().find_map(|r| r.err());

        let pending: Vec<InboundStream> = self
            .shared
            .registry
            .lock()
            .pending
            .drain()
            .map(|(_, inbound)| inbound)
            .collect();
        for inbound in pending {
            if let Err(err) = inbound.stream.close().await {
                trace!(error = %err, "closing buffered stream failed");
            }
        }

        self.shared.offered_tx.lock().take();
        if let Some(connection) = &self.shared.connection {
            if let Err(err) = connection.close().await {
                warn!(error = %err, "closing connection failed");
            }
        }

        self.shared.state.send_replace(SessionState::Closed);
        let _ = self.shared.events.send(SessionEvent::Closed(first_error.clone()));
        debug!(error = ?first_error, "session closed");

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Resolves once the session has fully closed.
    pub async fn closed(&self) {
        let mut rx = self.shared.state.subscribe();
        let _ = rx.wait_for(|state| *state == SessionState::Closed).await;
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Number of live channels and byte streams.
    pub fn channel_count(&self) -> usize {
        self.shared.registry.lock().channels.len()
    }

    /// Number of buffered streams still waiting for a reference.
    pub fn pending_count(&self) -> usize {
        self.shared.registry.lock().pending.len()
    }

    pub fn contains_channel(&self, id: ChannelId) -> bool {
        self.shared.registry.lock().channels.contains_key(&id)
    }

    pub fn is_pending(&self, id: ChannelId) -> bool {
        self.shared.registry.lock().pending.contains_key(&id)
    }
}

/// Obtain a stream for a locally created endpoint and bind it.
async fn establish_stream(
    core: Arc<EndpointCore>,
    parent: Option<Arc<EndpointCore>>,
    connection: Option<Arc<dyn Connection>>,
) {
    let headers = StreamHeaders::for_channel(core.id(), parent.as_ref().map(|p| p.id()));
    let opened = match &parent {
        Some(parent) => open_child(parent, connection.as_deref(), headers).await,
        None => match &connection {
            Some(connection) => connection.open_stream(headers).await.map_err(ChanError::from),
            None => Err(TransportError::NotConnected.into()),
        },
    };

    match opened {
        Ok(stream) => {
            if let Err(err) = core.bind(stream).await {
                debug!(channel_id = %core.id(), error = %err, "established stream not used");
            }
        }
        Err(err) => core.fail(err),
    }
}

async fn open_child(
    parent: &EndpointCore,
    connection: Option<&dyn Connection>,
    headers: StreamHeaders,
) -> Result<Box<dyn FrameStream>> {
    let stream = parent.bound_stream().await?;
    if stream.supports_push() {
        trace!(parent = %parent.id(), "pushing child stream");
        return Ok(stream.push(headers).await?);
    }
    match connection {
        Some(connection) => Ok(connection.open_stream(headers).await?),
        None => Err(TransportError::PushUnsupported(stream.name().to_string()).into()),
    }
}

fn spawn_accept_loop(session: Weak<SessionShared>, connection: Arc<dyn Connection>) {
    let mut state = match session.upgrade() {
        Some(shared) => shared.state.subscribe(),
        None => return,
    };

    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                accepted = connection.accept_stream() => accepted,
                _ = async { let _ = state.wait_for(|s| *s != SessionState::Open).await; } => break,
            };

            let inbound = match accepted {
                Ok(Some(inbound)) => inbound,
                Ok(None) => {
                    debug!(connection = connection.name(), "connection finished");
                    break;
                }
                Err(err) => {
                    warn!(connection = connection.name(), error = %err, "accepting stream failed");
                    break;
                }
            };

            let Some(shared) = session.upgrade() else {
                break;
            };
            let InboundStream { headers, stream } = inbound;
            if let Err(err) = Session::from_shared(shared).on_inbound_stream(headers, stream).await {
                trace!(error = %err, "inbound stream rejected");
            }
        }
    });
}
