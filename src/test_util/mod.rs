use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

use crate::transport::channel::{Channel, ChannelDirection};
use crate::transport::channel_events::ChannelEvent;
use crate::transport::letter::{Letter, LetterType};
use crate::transport::node_id::NodeId;
use crate::transport::socket_config::SocketConfig;

/// convenience for unit test code: the same number always gives the same node id
pub fn test_node_id(number: u128) -> NodeId {
    NodeId::from_uuid(Uuid::from_u128(number))
}

pub fn test_channel() -> (Arc<Channel>, mpsc::UnboundedReceiver<ChannelEvent>) {
    test_channel_with(SocketConfig {
        node_id: test_node_id(1),
        ..SocketConfig::new()
    })
}

pub fn test_channel_with(config: SocketConfig) -> (Arc<Channel>, mpsc::UnboundedReceiver<ChannelEvent>) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let channel = Channel::new(
        "127.0.0.1:9999".parse().expect("valid test address"),
        ChannelDirection::Outbound,
        Arc::new(config),
        events_tx,
    );
    (channel, events_rx)
}

/// read one complete frame off the wire and decode it
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Letter {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.unwrap();
    let total = u32::from_le_bytes(len_buf) as usize;

    let mut frame = vec![0u8; total];
    frame[..4].copy_from_slice(&len_buf);
    reader.read_exact(&mut frame[4..]).await.unwrap();
    Letter::try_deser_frame(&mut &frame[..]).unwrap()
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, letter: &Letter) {
    let mut buf = BytesMut::new();
    letter.ser(&mut buf);
    writer.write_all(&buf).await.unwrap();
}

/// Scripts the remote side of the Initialize handshake on a raw stream and waits for the
///  channel to report ready. Consumes the Connected and Initialized events.
pub async fn drive_handshake_as_peer(
    remote: &mut DuplexStream,
    peer_node_id: NodeId,
    events: &mut mpsc::UnboundedReceiver<ChannelEvent>,
) {
    // the channel opens with its own Initialize
    let init = read_frame(remote).await;
    assert_eq!(init.letter_type, LetterType::Initialize);

    write_frame(remote, &Letter::initialize(peer_node_id)).await;
    write_frame(remote, &Letter::ack()).await;

    // the channel acknowledges our Initialize in turn
    let ack = read_frame(remote).await;
    assert_eq!(ack.letter_type, LetterType::Ack);

    assert!(matches!(next_event(events).await, ChannelEvent::Connected { .. }));
    match next_event(events).await {
        ChannelEvent::Initialized { remote_node_id, .. } => assert_eq!(remote_node_id, peer_node_id),
        other => panic!("expected the channel to initialize, got {:?}", other),
    }
}

/// next event, failing the test after a generous timeout
pub async fn next_event<T>(events: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event stream ended")
}

/// asserts that nothing arrives within the given window
pub async fn expect_no_event<T: std::fmt::Debug>(events: &mut mpsc::UnboundedReceiver<T>, window: Duration) {
    if let Ok(Some(event)) = timeout(window, events.recv()).await {
        panic!("unexpected event: {:?}", event);
    }
}
