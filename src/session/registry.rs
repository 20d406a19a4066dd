//! Channel tables of one session and the stream/reference rendezvous.
//!
//! Everything here runs under the session's table lock, so each decision
//! (bind, buffer, offer or reject) is atomic with respect to the others.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tracing::trace;

use super::SessionShared;
use crate::channel::endpoint::{ChannelState, EndpointCore};
use crate::error::{ChanError, Result};
use crate::transport::{FrameStream, InboundStream};
use crate::wire::types::{ChannelId, ChannelIdAllocator, Direction, EndpointKind};

/// Result of resolving a `libchan-parent-ref` header.
#[derive(Debug)]
pub(crate) enum ParentLookup {
    Live(Arc<EndpointCore>),
    /// A top-level stream nobody has claimed yet.
    Pending,
    /// Existed once and has been closed since.
    Retired,
    Unknown,
}

/// What happened to an inbound stream.
#[derive(Debug)]
pub(crate) enum Admission {
    /// A top-level stream, buffered until `accept` or a decoded reference
    /// claims it.
    Offered(ChannelId),
    /// Bound to an endpoint that was waiting for it.
    Bound(ChannelId),
    /// Buffered until a reference to the id is decoded.
    Buffered(ChannelId),
    Reject(ChanError, Box<dyn FrameStream>),
}

#[derive(Debug, Default)]
pub(crate) struct Registry {
    pub(crate) channels: HashMap<ChannelId, Arc<EndpointCore>>,
    pub(crate) pending: HashMap<ChannelId, InboundStream>,
    retired: HashSet<ChannelId>,
    pub(crate) closing: bool,
}

impl Registry {
    pub(crate) fn lookup_parent(&self, id: ChannelId) -> ParentLookup {
        if let Some(core) = self.channels.get(&id) {
            ParentLookup::Live(core.clone())
        } else if self.pending.contains_key(&id) {
            ParentLookup::Pending
        } else if self.retired.contains(&id) {
            ParentLookup::Retired
        } else {
            ParentLookup::Unknown
        }
    }

    /// Check that the peer may introduce `id` as a new endpoint.
    fn check_new(&self, id: ChannelId, ids: &ChannelIdAllocator) -> Result<()> {
        if self.channels.contains_key(&id) || self.pending.contains_key(&id) {
            return Err(ChanError::DuplicateChannel(id));
        }
        if self.retired.contains(&id) {
            return Err(ChanError::ReusedId(id));
        }
        if ids.owns(id) {
            return Err(ChanError::IdOutOfRange(id));
        }
        Ok(())
    }

    /// Move a closed endpoint out of the live table. Returns whether it was
    /// live, so the close is announced once.
    pub(crate) fn retire(&mut self, id: ChannelId) -> bool {
        let removed = self.channels.remove(&id).is_some();
        self.retired.insert(id);
        removed
    }

    /// Decide what to do with a stream opened or pushed by the peer.
    pub(crate) fn admit(
        &mut self,
        inbound: InboundStream,
        ids: &ChannelIdAllocator,
    ) -> Admission {
        let InboundStream { headers, stream } = inbound;

        let header_ids = headers
            .channel_ref()
            .and_then(|id| headers.parent_ref().map(|parent| (id, parent)));
        let (id, parent) = match header_ids {
            Ok(ids) => ids,
            Err(err) => return Admission::Reject(err, stream),
        };
        if self.closing {
            return Admission::Reject(ChanError::SessionClosed, stream);
        }

        // A local endpoint waiting for exactly this stream.
        if let Some(core) = self.channels.get(&id).cloned() {
            if core.state() != ChannelState::Unbound {
                return Admission::Reject(ChanError::AlreadyBound(id), stream);
            }
            if let Some(parent_id) = parent {
                match self.lookup_parent(parent_id) {
                    ParentLookup::Live(handle) => core.set_parent(parent_id, Some(&handle)),
                    ParentLookup::Pending | ParentLookup::Retired => core.set_parent(parent_id, None),
                    ParentLookup::Unknown => {
                        return Admission::Reject(
                            ChanError::UnknownParent { id, parent: parent_id },
                            stream,
                        );
                    }
                }
            }
            return match core.try_bind(stream) {
                Ok(()) => Admission::Bound(id),
                Err((err, stream)) => Admission::Reject(err, stream),
            };
        }

        if let Err(err) = self.check_new(id, ids) {
            return Admission::Reject(err, stream);
        }

        match parent {
            None => {
                self.pending.insert(id, InboundStream { headers, stream });
                Admission::Offered(id)
            }
            Some(parent_id) => {
                if let ParentLookup::Unknown = self.lookup_parent(parent_id) {
                    return Admission::Reject(
                        ChanError::UnknownParent { id, parent: parent_id },
                        stream,
                    );
                }
                self.pending.insert(id, InboundStream { headers, stream });
                Admission::Buffered(id)
            }
        }
    }

    /// Turn an offered top-level stream into a read channel, unless a
    /// decoded reference got to it first.
    pub(crate) fn claim_root(
        &mut self,
        id: ChannelId,
        session: &Weak<SessionShared>,
    ) -> Option<Arc<EndpointCore>> {
        if self.closing {
            return None;
        }
        let offered = self
            .pending
            .get(&id)
            .is_some_and(|inbound| matches!(inbound.headers.parent_ref(), Ok(None)));
        if !offered {
            return None;
        }

        let InboundStream { stream, .. } = self.pending.remove(&id)?;
        let core = EndpointCore::with_stream(
            id,
            EndpointKind::Channel(Direction::Read),
            session.clone(),
            stream,
        );
        self.channels.insert(id, core.clone());
        Some(core)
    }

    /// Register endpoints decoded from one message. Either all of them are
    /// accepted or none is.
    pub(crate) fn register_decoded(
        &mut self,
        decoded: Vec<Arc<EndpointCore>>,
        ids: &ChannelIdAllocator,
    ) -> Result<()> {
        if self.closing {
            return Err(ChanError::SessionClosed);
        }

        let mut seen = HashSet::with_capacity(decoded.len());
        for core in &decoded {
            let id = core.id();
            if !seen.insert(id) {
                return Err(ChanError::DuplicateChannel(id));
            }
            match core.state() {
                ChannelState::Unbound => {}
                ChannelState::Bound => return Err(ChanError::AlreadyBound(id)),
                _ => return Err(ChanError::ChannelClosed(id)),
            }
            if self.pending.contains_key(&id) {
                continue;
            }
            self.check_new(id, ids)?;
        }

        for core in decoded {
            let id = core.id();
            if let Some(InboundStream { headers, stream }) = self.pending.remove(&id) {
                if let Ok(Some(parent_id)) = headers.parent_ref() {
                    match self.lookup_parent(parent_id) {
                        ParentLookup::Live(handle) => core.set_parent(parent_id, Some(&handle)),
                        _ => core.set_parent(parent_id, None),
                    }
                }
                if let Err((err, stream)) = core.try_bind(stream) {
                    // bound concurrently through `handle`; keep the stream buffered
                    trace!(channel_id = %id, error = %err, "buffered stream stays pending");
                    self.pending.insert(id, InboundStream { headers, stream });
                }
            }
            self.channels.insert(id, core);
        }

        Ok(())
    }
}
