//! State shared by every handle to one channel or byte stream.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::error::{ChanError, Result};
use crate::session::{Session, SessionShared};
use crate::transport::FrameStream;
use crate::wire::types::{ChannelId, EndpointKind};

/// Lifecycle of a channel or byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Known by id, no transport stream yet.
    Unbound,
    Bound,
    /// Establishing the transport stream failed.
    Failed,
    Closing,
    Closed,
}

#[derive(Debug, Clone)]
pub(crate) enum EndpointState {
    Unbound,
    Bound(Arc<dyn FrameStream>),
    Failed(ChanError),
    Closing,
    Closed,
}

impl EndpointState {
    fn public(&self) -> ChannelState {
        match self {
            EndpointState::Unbound => ChannelState::Unbound,
            EndpointState::Bound(_) => ChannelState::Bound,
            EndpointState::Failed(_) => ChannelState::Failed,
            EndpointState::Closing => ChannelState::Closing,
            EndpointState::Closed => ChannelState::Closed,
        }
    }
}

#[derive(Debug)]
struct ParentLink {
    id: ChannelId,
    handle: Weak<EndpointCore>,
}

/// A stream that could not be bound, handed back to the caller.
pub(crate) type Rejected = (ChanError, Box<dyn FrameStream>);

#[derive(Debug)]
pub(crate) struct EndpointCore {
    id: ChannelId,
    kind: EndpointKind,
    session: Weak<SessionShared>,
    parent: OnceLock<ParentLink>,
    state: watch::Sender<EndpointState>,
    /// Tasks inside `bound_stream`. Only these count as listeners for a
    /// failed bind.
    bind_waiters: AtomicUsize,
}

/// Keeps `bind_waiters` accurate when a waiter is dropped mid-wait.
struct BindWaiter<'a>(&'a AtomicUsize);

impl<'a> BindWaiter<'a> {
    fn enter(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count)
    }
}

impl Drop for BindWaiter<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl EndpointCore {
    pub(crate) fn new(id: ChannelId, kind: EndpointKind, session: Weak<SessionShared>) -> Arc<Self> {
        Self::with_state(id, kind, session, EndpointState::Unbound)
    }

    /// An endpoint that starts out bound to `stream`.
    pub(crate) fn with_stream(
        id: ChannelId,
        kind: EndpointKind,
        session: Weak<SessionShared>,
        stream: Box<dyn FrameStream>,
    ) -> Arc<Self> {
        Self::with_state(id, kind, session, EndpointState::Bound(Arc::from(stream)))
    }

    fn with_state(
        id: ChannelId,
        kind: EndpointKind,
        session: Weak<SessionShared>,
        state: EndpointState,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            kind,
            session,
            parent: OnceLock::new(),
            state: watch::Sender::new(state),
            bind_waiters: AtomicUsize::new(0),
        })
    }

    pub(crate) fn id(&self) -> ChannelId {
        self.id
    }

    pub(crate) fn kind(&self) -> EndpointKind {
        self.kind
    }

    pub(crate) fn state(&self) -> ChannelState {
        self.state.borrow().public()
    }

    /// Whether this endpoint was created by `session`.
    pub(crate) fn belongs_to(&self, session: &SessionShared) -> bool {
        std::ptr::eq(self.session.as_ptr(), session)
    }

    pub(crate) fn session(&self) -> Result<Session> {
        self.session
            .upgrade()
            .map(Session::from_shared)
            .ok_or(ChanError::SessionClosed)
    }

    /// Record the parent relation. Only the first call has any effect.
    pub(crate) fn set_parent(&self, id: ChannelId, handle: Option<&Arc<EndpointCore>>) {
        let link = ParentLink {
            id,
            handle: handle.map(Arc::downgrade).unwrap_or_default(),
        };
        if self.parent.set(link).is_err() {
            trace!(channel_id = %self.id, parent = %id, "parent already set, ignoring");
        }
    }

    pub(crate) fn parent_id(&self) -> Option<ChannelId> {
        self.parent.get().map(|link| link.id)
    }

    pub(crate) fn parent(&self) -> Option<Arc<EndpointCore>> {
        self.parent.get().and_then(|link| link.handle.upgrade())
    }

    /// Attach a transport stream. Fails if already bound or terminated, in
    /// which case the stream is handed back untouched.
    pub(crate) fn try_bind(&self, stream: Box<dyn FrameStream>) -> std::result::Result<(), Rejected> {
        let mut slot = Some(stream);
        let mut error = None;

        self.state.send_if_modified(|state| match state {
            EndpointState::Unbound => match slot.take() {
                Some(stream) => {
                    *state = EndpointState::Bound(Arc::from(stream));
                    true
                }
                None => false,
            },
            EndpointState::Bound(_) => {
                error = Some(ChanError::AlreadyBound(self.id));
                false
            }
            _ => {
                error = Some(ChanError::ChannelClosed(self.id));
                false
            }
        });

        match (error, slot) {
            (Some(err), Some(stream)) => Err((err, stream)),
            _ => {
                debug!(channel_id = %self.id, kind = %self.kind, "channel bound");
                Ok(())
            }
        }
    }

    /// Bind, terminating the stream if it cannot be used.
    pub(crate) async fn bind(&self, stream: Box<dyn FrameStream>) -> Result<()> {
        match self.try_bind(stream) {
            Ok(()) => Ok(()),
            Err((err, stream)) => {
                if let Err(close_err) = stream.close().await {
                    trace!(channel_id = %self.id, error = %close_err, "closing rejected stream failed");
                }
                Err(err)
            }
        }
    }

    /// Mark a bind attempt as failed. The error goes to whoever waits on the
    /// channel; with nobody waiting it is escalated to the session.
    pub(crate) fn fail(&self, err: ChanError) {
        let failed = self.state.send_if_modified(|state| match state {
            EndpointState::Unbound => {
                *state = EndpointState::Failed(err.clone());
                true
            }
            _ => false,
        });
        if !failed {
            trace!(channel_id = %self.id, error = %err, "bind failure after terminal state, ignoring");
            return;
        }

        if self.bind_waiters.load(Ordering::SeqCst) > 0 {
            debug!(channel_id = %self.id, error = %err, "channel failed");
            return;
        }

        warn!(channel_id = %self.id, error = %err, "channel failed with no listener");
        if let Some(session) = self.session.upgrade() {
            session.report(err);
        }
    }

    /// Wait until the channel has a stream to use.
    pub(crate) async fn bound_stream(&self) -> Result<Arc<dyn FrameStream>> {
        let _waiter = BindWaiter::enter(&self.bind_waiters);
        let mut rx = self.state.subscribe();
        let state = {
            let current = rx
                .wait_for(|state| !matches!(state, EndpointState::Unbound))
                .await
                .map_err(|_| ChanError::ChannelClosed(self.id))?;
            (*current).clone()
        };

        match state {
            EndpointState::Bound(stream) => Ok(stream),
            EndpointState::Failed(err) => Err(err),
            _ => Err(ChanError::ChannelClosed(self.id)),
        }
    }

    /// Tear the channel down. The first caller drives the transition and
    /// gets the outcome of closing the stream; later callers wait for it
    /// (`force` callers return immediately).
    pub(crate) async fn shutdown(&self, force: bool) -> Result<()> {
        let mut previous = None;
        let started = self.state.send_if_modified(|state| match state {
            EndpointState::Closing | EndpointState::Closed => false,
            _ => {
                previous = Some(std::mem::replace(state, EndpointState::Closing));
                true
            }
        });

        if !started {
            if !force {
                self.closed().await;
            }
            return Ok(());
        }

        let result = match previous {
            Some(EndpointState::Bound(stream)) => {
                if let Some(stats) = stream.stats() {
                    trace!(
                        channel_id = %self.id,
                        frames_sent = stats.messages_sent,
                        frames_received = stats.messages_received,
                        bytes_sent = stats.bytes_sent,
                        bytes_received = stats.bytes_received,
                        errors = stats.send_errors + stats.recv_errors,
                        "closing stream"
                    );
                }
                stream
                    .close()
                    .await
                    .map_err(|e| ChanError::CloseFailed {
                        id: self.id,
                        reason: e.to_string(),
                    })
            }
            _ => Ok(()),
        };

        self.state.send_replace(EndpointState::Closed);
        debug!(channel_id = %self.id, force, "channel closed");

        if let Some(session) = self.session.upgrade() {
            session.retire(self.id);
        }

        result
    }

    /// Resolves once the channel has reached `Closed`.
    pub(crate) async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx
            .wait_for(|state| matches!(state, EndpointState::Closed))
            .await;
    }
}
