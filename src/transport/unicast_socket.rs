use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::select;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::transport::channel_events::{ChannelEvent, SocketEvent};
use crate::transport::channel_fleet::ChannelFleet;
use crate::transport::letter::{Letter, LetterType};
use crate::transport::socket_config::SocketConfig;

/// The public face of the transport: binds listeners, dials peers, routes outbound
///  letters over the fleet of ready channels and surfaces [SocketEvent]s.
///
/// Sending is synchronous and never blocks; delivery is asynchronous. Multicast letters
///  are enqueued on every ready channel, everything else round-robins over them. When no
///  channel is ready a letter fails fast: silent-discard letters are dropped, all others
///  surface as [SocketEvent::NotDeliverable].
pub struct UnicastSocket {
    inner: Arc<SocketInner>,
}

struct SocketInner {
    config: Arc<SocketConfig>,
    fleet: ChannelFleet,
    round_robin: AtomicUsize,
    app_events: mpsc::UnboundedSender<SocketEvent>,
}

impl UnicastSocket {
    /// Returns the socket and the stream its events are delivered on. A dispatcher task
    ///  consumes channel events until the socket is disposed and every channel is gone.
    pub fn new(config: SocketConfig) -> (UnicastSocket, mpsc::UnboundedReceiver<SocketEvent>) {
        let config = Arc::new(config);
        let (channel_events_tx, channel_events_rx) = mpsc::unbounded_channel();
        let (app_events_tx, app_events_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(SocketInner {
            config: config.clone(),
            fleet: ChannelFleet::new(config, channel_events_tx),
            round_robin: AtomicUsize::new(0),
            app_events: app_events_tx,
        });
        tokio::spawn(dispatcher_loop(inner.clone(), channel_events_rx));

        (UnicastSocket { inner }, app_events_rx)
    }

    /// listen on `addr`, which may carry port 0; returns the actually bound address
    pub async fn bind(&self, addr: SocketAddr) -> anyhow::Result<SocketAddr> {
        self.inner.fleet.bind(addr).await
    }

    /// dial `binding` in the background; the channel keeps redialing until disposed
    pub fn connect(&self, binding: SocketAddr) {
        self.inner.fleet.connect(binding);
    }

    pub fn send(&self, letter: Letter) {
        self.inner.route(letter);
    }

    /// idempotent; every channel shuts down with reason Requested
    pub fn dispose(&self) {
        self.inner.fleet.dispose();
    }
}

impl SocketInner {
    fn publish(&self, event: SocketEvent) {
        let _ = self.app_events.send(event);
    }

    /// Letters are validated here rather than per channel, so a rejected letter cannot
    ///  ping-pong between a channel's failure event and the re-routing below.
    fn route(&self, letter: Letter) {
        match letter.letter_type {
            LetterType::User | LetterType::Batch => {}
            _ => {
                warn!("only user and batch letters can be sent, rejecting {:?}", letter);
                self.undeliverable(letter);
                return;
            }
        }
        if letter.wire_len() > self.config.max_letter_size || letter.parts.len() > usize::from(u16::MAX) {
            warn!("rejecting oversized letter {:?}", letter);
            self.undeliverable(letter);
            return;
        }

        let ready = self.fleet.ready_channels();
        if ready.is_empty() {
            self.undeliverable(letter);
            return;
        }
        if letter.is_multicast() {
            for channel in &ready {
                channel.enqueue(letter.clone());
            }
            return;
        }
        let index = self.round_robin.fetch_add(1, Ordering::Relaxed) % ready.len();
        ready[index].enqueue(letter);
    }

    fn undeliverable(&self, letter: Letter) {
        if letter.is_silent_discard() {
            trace!("no ready channel, silently discarding {:?}", letter);
        }
        else {
            debug!("no ready channel for {:?}", letter);
            self.publish(SocketEvent::NotDeliverable(letter));
        }
    }
}

/// Consumes the event streams of all channels: forwards the application-facing ones,
///  re-routes failed letters, and prunes terminated channels from the fleet.
async fn dispatcher_loop(inner: Arc<SocketInner>, mut channel_events: mpsc::UnboundedReceiver<ChannelEvent>) {
    let mut disposed = inner.fleet.disposed();
    loop {
        let event = select! {
            _ = disposed.changed() => {
                if inner.fleet.is_empty() {
                    break;
                }
                continue;
            }
            event = channel_events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            ChannelEvent::Connected { binding } => {
                debug!(?binding, "channel connected, handshake running");
            }
            ChannelEvent::Initialized { binding, remote_node_id } => {
                debug!(?binding, "channel ready, peer is {:?}", remote_node_id);
                inner.publish(SocketEvent::Connected(binding));
            }
            ChannelEvent::Received(letter) => inner.publish(SocketEvent::Received(letter)),
            ChannelEvent::Sent(letter) => inner.publish(SocketEvent::Sent(letter)),
            ChannelEvent::FailedToSend(letter) => {
                // the channel it was routed to went away under it - try the survivors
                inner.route(letter);
            }
            ChannelEvent::QueueEmpty { binding } => trace!(?binding, "pending queue drained"),
            ChannelEvent::Disconnected { binding, reason } => {
                inner.publish(SocketEvent::Disconnected(binding, reason));
            }
            ChannelEvent::Terminated { binding } => {
                inner.fleet.remove(&binding);
                if *disposed.borrow() && inner.fleet.is_empty() {
                    break;
                }
            }
        }
    }
    debug!("dispatcher stopped");
}
