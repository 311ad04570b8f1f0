use std::net::SocketAddr;

use crate::transport::letter::Letter;
use crate::transport::node_id::NodeId;

/// Why a channel's connection went away. `Requested` is a local disposal, `Remote` is an
///  orderly EOF from the peer, `Socket` covers I/O failures and protocol violations.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum DisconnectReason {
    Requested,
    Socket,
    Remote,
}

/// Raised by a single channel and consumed by the socket's dispatcher loop. These are the
///  channel-level counterparts of [SocketEvent]; the dispatcher decides what surfaces.
#[derive(Debug)]
pub(crate) enum ChannelEvent {
    /// the TCP connection is up, the handshake is about to run
    Connected { binding: SocketAddr },
    /// both sides completed the Initialize handshake; the channel is ready for traffic
    Initialized { binding: SocketAddr, remote_node_id: NodeId },
    Received(Letter),
    Sent(Letter),
    /// the letter could not be (or was not) transmitted on this channel; the dispatcher
    ///  re-routes it
    FailedToSend(Letter),
    /// the pending queue drained completely
    QueueEmpty { binding: SocketAddr },
    Disconnected { binding: SocketAddr, reason: DisconnectReason },
    /// the channel's supervising task ended; the fleet forgets the channel
    Terminated { binding: SocketAddr },
}

/// Application-facing events of a [crate::UnicastSocket], delivered on the stream returned
///  from [crate::UnicastSocket::new].
#[derive(Debug)]
pub enum SocketEvent {
    /// a channel to this binding completed its handshake
    Connected(SocketAddr),
    Disconnected(SocketAddr, DisconnectReason),
    Received(Letter),
    /// delivery of this letter is complete: transmitted, and acknowledged if it asked for that
    Sent(Letter),
    /// the letter could not be routed to any ready channel and did not ask for silent discard
    NotDeliverable(Letter),
}
