use std::time::Duration;

use crate::transport::node_id::NodeId;

#[derive(Debug)]
pub struct SocketConfig {
    /// identifies this node to peers; exchanged during the Initialize handshake
    pub node_id: NodeId,

    /// cadence of the per-channel idle check; one heartbeat letter is sent per idle tick
    pub heartbeat_interval: Duration,
    /// backoff before an outbound channel redials after losing its connection
    pub reconnect_delay: Duration,

    /// upper bound on a single letter's wire size. Frames declaring more are rejected
    ///  before any allocation happens, so a hostile length prefix cannot force one
    pub max_letter_size: usize,
}

impl SocketConfig {
    pub fn new() -> SocketConfig {
        SocketConfig {
            node_id: NodeId::random(),
            heartbeat_interval: Duration::from_secs(1),
            reconnect_delay: Duration::from_millis(500),
            max_letter_size: 16 * 1024 * 1024,
        }
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        SocketConfig::new()
    }
}
