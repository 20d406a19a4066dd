mod common;

use chanpass::{
    ChanError, Channel, ChannelId, ChannelState, Connection, Direction, FrameStream, Role,
    Session, SessionConfig, SessionEvent, TransportError,
};
use common::{StubStream, deliver, eventually, init_tracing, raw_pair};
use tokio::sync::broadcast::error::TryRecvError;

fn acceptor() -> Session {
    Session::detached(SessionConfig::default())
}

fn initiator() -> Session {
    Session::detached(SessionConfig::new().with_role(Role::Initiator))
}

#[test]
fn test_ids_strictly_increase_by_stride() {
    for (session, first) in [(acceptor(), 2u32), (initiator(), 1u32)] {
        let mut expected = first;
        for i in 0..50 {
            let id = if i % 3 == 0 {
                session.create_byte_stream(None).unwrap().id()
            } else {
                session.create_channel(Direction::Read, None).unwrap().id()
            };
            assert_eq!(id, ChannelId(expected));
            expected += 2;
        }
        assert_eq!(session.channel_count(), 50);
    }
}

#[tokio::test]
async fn test_root_read_channel_decodes_as_write_on_peer() {
    init_tracing();
    let local = acceptor();
    let peer = initiator();

    let root = local.create_channel(Direction::Read, None).unwrap();
    assert_eq!(root.id(), ChannelId(2));

    let bytes = local.encoder().encode(&root).unwrap();
    assert_eq!(&bytes[2..], &[0x01, 0x02, 0, 0, 0, 2]);

    let decoded: Channel = peer.encoder().decode(&bytes).unwrap();
    assert_eq!(decoded.id(), ChannelId(2));
    assert_eq!(decoded.direction(), Direction::Write);
    assert_eq!(decoded.state(), ChannelState::Unbound);
    assert!(peer.contains_channel(ChannelId(2)));
}

#[tokio::test]
async fn test_unknown_direction_tag_is_reported() {
    init_tracing();
    let session = acceptor();
    let mut events = session.subscribe();

    // ext8, len 5, type 1, tag 0x3, id 7
    let bytes = [0xc7, 0x05, 0x01, 0x03, 0, 0, 0, 7];
    let err = session.encoder().decode::<Channel>(&bytes).unwrap_err();

    assert_eq!(err, ChanError::UnknownDirection(0x3));
    assert!(err.is_protocol());
    assert_eq!(session.channel_count(), 0);
    assert_eq!(
        events.recv().await.unwrap(),
        SessionEvent::Error(ChanError::UnknownDirection(0x3))
    );
    assert_eq!(session.state(), chanpass::SessionState::Open);
}

#[tokio::test]
async fn test_stream_before_reference() {
    init_tracing();
    let (remote, local) = raw_pair();
    let session = acceptor();
    let peer = initiator();

    let _root = deliver(&remote, &local, &session, 1, None).await;
    let inbox = session.accept().await.unwrap();

    let child_stream = deliver(&remote, &local, &session, 3, Some(1)).await;
    assert!(session.is_pending(ChannelId(3)));
    assert!(!session.contains_channel(ChannelId(3)));

    // the peer's read channel 3 travels as a write reference
    let _first = peer.create_channel(Direction::Read, None).unwrap();
    let reply = peer.create_channel(Direction::Read, None).unwrap();
    assert_eq!(reply.id(), ChannelId(3));
    let bytes = peer.encoder().encode(&reply).unwrap();

    let decoded: Channel = session.encoder().decode(&bytes).unwrap();
    assert_eq!(decoded.direction(), Direction::Write);
    assert_eq!(decoded.state(), ChannelState::Bound);
    assert_eq!(decoded.parent_id(), Some(ChannelId(1)));
    assert_eq!(decoded.parent().unwrap().id(), inbox.id());
    assert_eq!(session.pending_count(), 0);

    decoded.send("pong").await.unwrap();
    let frame = child_stream.recv_frame().await.unwrap().unwrap();
    assert_eq!(rmp_serde::from_slice::<String>(&frame).unwrap(), "pong");
}

#[tokio::test]
async fn test_reference_before_stream() {
    init_tracing();
    let (remote, local) = raw_pair();
    let session = acceptor();
    let peer = initiator();

    let _root = deliver(&remote, &local, &session, 1, None).await;
    let _inbox = session.accept().await.unwrap();

    let _first = peer.create_channel(Direction::Write, None).unwrap();
    let upload = peer.create_channel(Direction::Write, None).unwrap();
    let bytes = peer.encoder().encode(&vec![upload]).unwrap();

    let decoded: Vec<Channel> = session.encoder().decode(&bytes).unwrap();
    let reader = decoded[0].clone();
    assert_eq!(reader.direction(), Direction::Read);
    assert_eq!(reader.state(), ChannelState::Unbound);
    assert!(session.contains_channel(ChannelId(3)));

    let waiter = {
        let reader = reader.clone();
        tokio::spawn(async move { reader.recv::<u32>().await })
    };

    let child_stream = deliver(&remote, &local, &session, 3, Some(1)).await;
    assert_eq!(reader.state(), ChannelState::Bound);
    assert_eq!(reader.parent_id(), Some(ChannelId(1)));

    child_stream
        .send_frame(&rmp_serde::to_vec(&42u32).unwrap())
        .await
        .unwrap();
    assert_eq!(waiter.await.unwrap().unwrap(), Some(42));
}

#[tokio::test]
async fn test_duplicate_reference_is_protocol_error() {
    init_tracing();
    let session = acceptor();
    let peer = initiator();
    let mut events = session.subscribe();

    let channel = peer.create_channel(Direction::Write, None).unwrap();
    let bytes = peer.encoder().encode(&channel).unwrap();

    let _first: Channel = session.encoder().decode(&bytes).unwrap();
    let err = session.encoder().decode::<Channel>(&bytes).unwrap_err();
    assert_eq!(err, ChanError::DuplicateChannel(channel.id()));
    assert_eq!(events.recv().await.unwrap(), SessionEvent::Error(err));
    assert_eq!(session.channel_count(), 1);
}

#[tokio::test]
async fn test_push_failure_stays_on_child() {
    init_tracing();
    let session = acceptor();
    let mut events = session.subscribe();

    let _unused = session.create_channel(Direction::Read, None).unwrap();
    let parent = session.create_channel(Direction::Write, None).unwrap();
    assert_eq!(parent.id(), ChannelId(4));
    parent.handle(Box::new(StubStream::failing_push())).await.unwrap();

    let child = parent.create_channel(Direction::Read).unwrap();
    assert_eq!(child.id(), ChannelId(6));
    assert_eq!(child.parent_id(), Some(ChannelId(4)));

    let err = child.wait_bound().await.unwrap_err();
    assert_eq!(
        err,
        ChanError::Transport(TransportError::PushFailed("refused by stub".into()))
    );
    assert_eq!(child.state(), ChannelState::Failed);
    assert!(child.recv::<u8>().await.is_err());

    assert_eq!(parent.state(), ChannelState::Bound);
    assert_eq!(session.state(), chanpass::SessionState::Open);
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn test_unobserved_child_failure_reaches_session() {
    init_tracing();
    let session = acceptor();
    let mut events = session.subscribe();

    let parent = session.create_channel(Direction::Write, None).unwrap();
    parent.handle(Box::new(StubStream::failing_push())).await.unwrap();
    let child = parent.create_byte_stream().unwrap();

    eventually(|| child.state() == ChannelState::Failed).await;
    assert!(matches!(
        events.recv().await.unwrap(),
        SessionEvent::Error(ChanError::Transport(TransportError::PushFailed(_)))
    ));
    assert_eq!(parent.state(), ChannelState::Bound);
}

#[tokio::test]
async fn test_child_without_push_or_connection() {
    init_tracing();
    let session = acceptor();
    let parent = session.create_channel(Direction::Write, None).unwrap();
    parent.handle(Box::new(StubStream::default())).await.unwrap();

    let child = parent.create_channel(Direction::Write).unwrap();
    assert!(matches!(
        child.wait_bound().await,
        Err(ChanError::Transport(TransportError::PushUnsupported(_)))
    ));
}

#[tokio::test]
async fn test_close_ends_live_and_pending() {
    init_tracing();
    let (remote, local) = raw_pair();
    let session = acceptor();
    let mut events = session.subscribe();

    let mut peers = Vec::new();
    for id in [1, 3, 5] {
        peers.push(deliver(&remote, &local, &session, id, None).await);
    }
    let accepted = session.accept().await.unwrap();
    assert_eq!(accepted.id(), ChannelId(1));
    for id in [7, 9] {
        peers.push(deliver(&remote, &local, &session, id, Some(1)).await);
    }
    assert_eq!(session.channel_count(), 1);
    // unclaimed top-level streams 3 and 5, children 7 and 9
    assert_eq!(session.pending_count(), 4);

    session.close().await.unwrap();

    assert!(session.is_closed());
    assert_eq!(session.channel_count(), 0);
    assert_eq!(session.pending_count(), 0);
    assert_eq!(accepted.state(), ChannelState::Closed);

    for stream in &peers {
        assert!(stream.recv_frame().await.unwrap().is_none());
    }

    assert_eq!(
        events.recv().await.unwrap(),
        SessionEvent::ChannelClosed(ChannelId(1))
    );
    assert_eq!(events.recv().await.unwrap(), SessionEvent::Closed(None));

    // nothing further once closed
    accepted.close().await.unwrap();
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    assert!(session.accept().await.is_none());
}

#[tokio::test]
async fn test_close_reports_first_error_and_closes_all() {
    init_tracing();
    let session = Session::detached(SessionConfig::default().with_close_concurrency(2));
    let mut events = session.subscribe();

    let mut channels = Vec::new();
    for i in 0..4 {
        let channel = session.create_channel(Direction::Write, None).unwrap();
        let stream = if i % 2 == 0 {
            StubStream::failing_close()
        } else {
            StubStream::default()
        };
        channel.handle(Box::new(stream)).await.unwrap();
        channels.push(channel);
    }

    let err = session.close().await.unwrap_err();
    assert!(matches!(err, ChanError::CloseFailed { .. }));
    for channel in &channels {
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    let mut closed = 0;
    loop {
        match events.recv().await.unwrap() {
            SessionEvent::ChannelClosed(_) => closed += 1,
            SessionEvent::Closed(error) => {
                assert_eq!(error, Some(err.clone()));
                break;
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
    assert_eq!(closed, 4);
}

#[tokio::test]
async fn test_closed_session_rejects_streams_and_references() {
    init_tracing();
    let (remote, local) = raw_pair();
    let session = acceptor();
    let peer = initiator();
    session.close().await.unwrap();

    let near = remote
        .open_stream(chanpass::StreamHeaders::for_channel(ChannelId(1), None))
        .await
        .unwrap();
    let inbound = local.accept_stream().await.unwrap().unwrap();
    let err = session
        .on_inbound_stream(inbound.headers, inbound.stream)
        .await
        .unwrap_err();
    assert_eq!(err, ChanError::SessionClosed);
    assert!(near.recv_frame().await.unwrap().is_none());

    let channel = peer.create_channel(Direction::Write, None).unwrap();
    let bytes = peer.encoder().encode(&channel).unwrap();
    assert_eq!(
        session.encoder().decode::<Channel>(&bytes).unwrap_err(),
        ChanError::SessionClosed
    );
}

#[tokio::test]
async fn test_reference_claims_unaccepted_top_level_stream() {
    init_tracing();
    let (remote, local) = raw_pair();
    let session = acceptor();
    let peer = initiator();

    let _requests = deliver(&remote, &local, &session, 1, None).await;
    let _inbox = session.accept().await.unwrap();

    // the peer's top-level read channel 3 arrives before the message naming it
    let _peer_requests = peer.create_channel(Direction::Write, None).unwrap();
    let replies = peer.create_channel(Direction::Read, None).unwrap();
    let replies_stream = deliver(&remote, &local, &session, replies.id().raw(), None).await;
    assert!(session.is_pending(replies.id()));

    let bytes = peer.encoder().encode(&replies).unwrap();
    let decoded: Channel = session.encoder().decode(&bytes).unwrap();
    assert_eq!(decoded.direction(), Direction::Write);
    assert_eq!(decoded.state(), ChannelState::Bound);
    assert_eq!(decoded.parent_id(), None);
    assert!(!session.is_pending(replies.id()));

    decoded.send(&5u8).await.unwrap();
    let frame = replies_stream.recv_frame().await.unwrap().unwrap();
    assert_eq!(rmp_serde::from_slice::<u8>(&frame).unwrap(), 5);

    // accept skips the claimed stream and yields the next one
    let _later = deliver(&remote, &local, &session, 5, None).await;
    assert_eq!(session.accept().await.unwrap().id(), ChannelId(5));
}

#[tokio::test]
async fn test_bind_failure_escalates_despite_close_watcher() {
    init_tracing();
    let session = acceptor();
    let mut events = session.subscribe();

    let parent = session.create_channel(Direction::Write, None).unwrap();
    let child = parent.create_byte_stream().unwrap();
    let watcher = {
        let child = child.clone();
        tokio::spawn(async move { child.closed().await })
    };
    tokio::task::yield_now().await;

    parent.handle(Box::new(StubStream::failing_push())).await.unwrap();
    let event = tokio::time::timeout(std::time::Duration::from_secs(5), events.recv())
        .await
        .expect("failure not escalated")
        .unwrap();
    assert!(matches!(
        event,
        SessionEvent::Error(ChanError::Transport(TransportError::PushFailed(_)))
    ));
    assert_eq!(child.state(), ChannelState::Failed);
    watcher.abort();
}

#[tokio::test]
async fn test_registering_foreign_or_bound_channels() {
    init_tracing();
    let session = acceptor();
    let other = initiator();

    let foreign = other.create_channel(Direction::Read, None).unwrap();
    assert_eq!(
        session.on_channel_decoded(&foreign),
        Err(ChanError::ForeignChannel(foreign.id()))
    );
    assert_eq!(session.channel_count(), 0);

    let bytes = other.encoder().encode(&foreign).unwrap();
    let decoded: Channel = session.encoder().decode(&bytes).unwrap();
    decoded.handle(Box::new(StubStream::default())).await.unwrap();
    assert_eq!(
        session.on_channel_decoded(&decoded),
        Err(ChanError::AlreadyBound(decoded.id()))
    );
    assert_eq!(session.channel_count(), 1);
}
