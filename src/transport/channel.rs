use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout};
use tracing::{debug, error, info, trace, warn};

use crate::transport::channel_events::{ChannelEvent, DisconnectReason};
use crate::transport::letter::{Letter, LetterType};
use crate::transport::letter_receiver::receive_loop;
use crate::transport::letter_transmitter::{transmit_loop, LetterTransmitter};
use crate::transport::node_id::NodeId;
use crate::transport::socket_config::SocketConfig;

/// how long a shutdown waits for the I/O actors to finish their current operation
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_millis(1500);

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ChannelDirection {
    /// accepted by a listener; destroyed when its connection ends
    Inbound,
    /// created by an explicit connect request; redials across disconnects
    Outbound,
}

/// One live TCP connection plus its protocol state.
///
/// The connection is full-duplex: a receive loop and a transmit loop run as independent
///  tasks, both calling back into this struct. Completion of outbound letters is tracked
///  positionally - the transport is FIFO in both directions, so the peer's n-th Ack
///  always refers to the oldest unconfirmed letter in `pending_ack_queue`.
pub struct Channel {
    pub binding: SocketAddr,
    pub direction: ChannelDirection,
    pub(crate) config: Arc<SocketConfig>,
    events: mpsc::UnboundedSender<ChannelEvent>,

    connected: AtomicBool,
    ready: AtomicBool,
    /// whether any send or receive happened since the last heartbeat tick
    activity: AtomicBool,

    /// NB: never held across an await point
    proto: Mutex<ProtocolState>,
}

#[derive(Default)]
struct ProtocolState {
    /// reaches 2 when the own Initialize was acknowledged and the peer's was delivered
    initialization_count: u8,
    remote_node_id: Option<NodeId>,
    /// letters awaiting completion; the head is the oldest unconfirmed letter
    pending_ack_queue: VecDeque<Letter>,
    /// ack-requesting letters from the peer, buffered until the local Ack frame is on the wire
    incoming_ack_queue: VecDeque<Letter>,
    transmitter: Option<LetterTransmitter>,
    cause: Option<mpsc::UnboundedSender<DisconnectReason>>,
}

/// Everything belonging to one connection attempt, owned by the supervising task.
pub(crate) struct ConnectionRuntime {
    pub cause_rx: mpsc::UnboundedReceiver<DisconnectReason>,
    cancel: watch::Sender<bool>,
    receiver: JoinHandle<()>,
    transmitter: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

impl Channel {
    pub(crate) fn new(
        binding: SocketAddr,
        direction: ChannelDirection,
        config: Arc<SocketConfig>,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Arc<Channel> {
        Arc::new(Channel {
            binding,
            direction,
            config,
            events,
            connected: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            activity: AtomicBool::new(false),
            proto: Mutex::new(ProtocolState::default()),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// steady state: both sides completed the Initialize handshake
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn remote_node_id(&self) -> Option<NodeId> {
        self.proto.lock().remote_node_id
    }

    fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn mark_activity(&self) {
        self.activity.store(true, Ordering::Release);
    }

    /// Send path for user and batch letters, validated by the dispatcher; only valid on
    ///  a ready channel. The letter joins `pending_ack_queue` before it is handed to the
    ///  transmitter, so the transmit callback is guaranteed to find it at the head.
    pub(crate) fn enqueue(&self, letter: Letter) {
        let mut proto = self.proto.lock();
        if !self.is_ready() || proto.transmitter.is_none() {
            drop(proto);
            self.fail(letter);
            return;
        }
        proto.pending_ack_queue.push_back(letter.clone());
        if let Some(transmitter) = &proto.transmitter {
            transmitter.enqueue(letter);
        }
    }

    /// silent-discard letters disappear without a user-visible failure
    fn fail(&self, letter: Letter) {
        if letter.is_silent_discard() {
            trace!(binding = ?self.binding, "silently discarding {:?}", letter);
        }
        else {
            self.emit(ChannelEvent::FailedToSend(letter));
        }
    }

    /// transmit-loop callback: the final byte of `letter` was accepted by the socket
    pub(crate) fn on_transmitted(&self, letter: Letter) {
        self.mark_activity();

        match letter.letter_type {
            LetterType::Ack => {
                // the "no delivery before the acknowledgement is on the wire" point
                let delivered = self.proto.lock().incoming_ack_queue.pop_front();
                match delivered {
                    Some(incoming) => self.deliver_up(incoming),
                    None => error!(binding = ?self.binding, "ack transmitted with no buffered incoming letter"),
                }
            }
            LetterType::Heartbeat => {
                trace!(binding = ?self.binding, "heartbeat transmitted");
            }
            _ if !letter.requests_ack() => {
                let head = self.proto.lock().pending_ack_queue.pop_front();
                match head {
                    Some(head) => self.handle_sent(head),
                    None => error!(binding = ?self.binding, "transmit callback found an empty pending queue"),
                }
            }
            _ => {
                trace!(binding = ?self.binding, "{:?} awaits the peer's acknowledgement", letter);
            }
        }
    }

    /// receive-loop callback, one decoded letter (heartbeats never get here)
    pub(crate) fn on_received(&self, letter: Letter) {
        trace!(binding = ?self.binding, "received {:?}", letter);

        match letter.letter_type {
            LetterType::Ack => {
                let head = self.proto.lock().pending_ack_queue.pop_front();
                match head {
                    Some(head) => self.handle_sent(head),
                    None => {
                        warn!(binding = ?self.binding, "peer acknowledged with nothing in flight - the connection is compromised");
                        self.request_shutdown(DisconnectReason::Socket);
                    }
                }
            }
            _ if letter.requests_ack() => {
                // delivery is deferred until the Ack frame's transmit callback fires
                let mut proto = self.proto.lock();
                proto.incoming_ack_queue.push_back(letter);
                if let Some(transmitter) = &proto.transmitter {
                    transmitter.enqueue(Letter::ack());
                }
            }
            _ => self.deliver_up(letter),
        }
    }

    /// a letter dequeued from `pending_ack_queue` completed its delivery
    fn handle_sent(&self, letter: Letter) {
        match letter.letter_type {
            LetterType::Initialize => self.bump_initialization_count(),
            LetterType::User | LetterType::Batch => {
                let queue_empty = self.proto.lock().pending_ack_queue.is_empty();
                self.emit(ChannelEvent::Sent(letter));
                if queue_empty {
                    self.emit(ChannelEvent::QueueEmpty { binding: self.binding });
                }
            }
            _ => error!(binding = ?self.binding, "unexpected {:?} in the pending queue", letter),
        }
    }

    /// surface a received letter (or, for Initialize and Batch, what it carries)
    fn deliver_up(&self, mut letter: Letter) {
        match letter.letter_type {
            LetterType::Initialize => {
                let node_id = match letter.parts.first().map(|part| NodeId::try_deser(&mut part.clone())) {
                    Some(Ok(node_id)) if letter.parts.len() == 1 => node_id,
                    _ => {
                        warn!(binding = ?self.binding, "initialize letter does not carry a node id - the connection is compromised");
                        self.request_shutdown(DisconnectReason::Socket);
                        return;
                    }
                };
                {
                    let mut proto = self.proto.lock();
                    // the count never exceeds 2; a later Initialize is a protocol violation
                    if proto.initialization_count >= 2 {
                        drop(proto);
                        warn!(binding = ?self.binding, "peer re-initialized an initialized channel - the connection is compromised");
                        self.request_shutdown(DisconnectReason::Socket);
                        return;
                    }
                    proto.remote_node_id = Some(node_id);
                }
                debug!(binding = ?self.binding, "peer identified as {:?}", node_id);
                self.bump_initialization_count();
            }
            LetterType::User => {
                letter.remote_node_id = self.proto.lock().remote_node_id;
                self.emit(ChannelEvent::Received(letter));
            }
            LetterType::Batch => {
                // the batch itself is never surfaced, its parts are
                let remote_node_id = self.proto.lock().remote_node_id;
                for mut part in letter.parts {
                    let mut inner = match Letter::try_deser_frame(&mut part) {
                        Ok(inner) => inner,
                        Err(e) => {
                            warn!(binding = ?self.binding, "batch contains a malformed letter: {}", e);
                            self.request_shutdown(DisconnectReason::Socket);
                            return;
                        }
                    };
                    match inner.letter_type {
                        // same type discipline as top-level letters: control letters
                        //  must not reach the application
                        LetterType::User | LetterType::Batch => {
                            inner.remote_node_id = remote_node_id;
                            self.emit(ChannelEvent::Received(inner));
                        }
                        _ => {
                            warn!(binding = ?self.binding, "batch carries a {:?} control letter - the connection is compromised", inner);
                            self.request_shutdown(DisconnectReason::Socket);
                            return;
                        }
                    }
                }
            }
            _ => error!(binding = ?self.binding, "{:?} must not be delivered upward", letter),
        }
    }

    fn bump_initialization_count(&self) {
        let (count, remote_node_id) = {
            let mut proto = self.proto.lock();
            proto.initialization_count += 1;
            (proto.initialization_count, proto.remote_node_id)
        };
        trace!(binding = ?self.binding, "initialization count is {}", count);

        if count == 2 && !self.ready.swap(true, Ordering::AcqRel) {
            match remote_node_id {
                Some(remote_node_id) => {
                    info!(binding = ?self.binding, "channel ready, peer is {:?}", remote_node_id);
                    self.emit(ChannelEvent::Initialized { binding: self.binding, remote_node_id });
                }
                None => error!(binding = ?self.binding, "initialization completed without a peer node id"),
            }
        }
    }

    fn request_shutdown(&self, reason: DisconnectReason) {
        if let Some(cause) = &self.proto.lock().cause {
            let _ = cause.send(reason);
        }
    }

    /// The socket is up: reset protocol state, start the I/O actors and the heartbeat
    ///  ticker, and open the handshake with the self-describing Initialize letter.
    pub(crate) fn connected<R, W>(self: &Arc<Self>, reader: R, writer: W) -> ConnectionRuntime
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (cause_tx, cause_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (transmitter, transmit_queue) = LetterTransmitter::new();

        let initialize = Letter::initialize(self.config.node_id);
        {
            let mut proto = self.proto.lock();
            proto.initialization_count = 0;
            proto.remote_node_id = None;
            proto.pending_ack_queue.clear();
            proto.incoming_ack_queue.clear();
            proto.pending_ack_queue.push_back(initialize.clone());
            transmitter.enqueue(initialize);
            proto.transmitter = Some(transmitter);
            proto.cause = Some(cause_tx.clone());
        }
        self.ready.store(false, Ordering::Release);
        self.activity.store(false, Ordering::Release);
        self.connected.store(true, Ordering::Release);
        debug!(binding = ?self.binding, direction = ?self.direction, "connected, starting handshake");
        self.emit(ChannelEvent::Connected { binding: self.binding });

        let receiver = tokio::spawn(receive_loop(reader, self.clone(), cancel_rx.clone(), cause_tx.clone()));
        let transmitter = tokio::spawn(transmit_loop(writer, transmit_queue, self.clone(), cancel_rx.clone(), cause_tx));
        let heartbeat = tokio::spawn(heartbeat_loop(self.clone(), cancel_rx));

        ConnectionRuntime {
            cause_rx,
            cancel: cancel_tx,
            receiver,
            transmitter,
            heartbeat,
        }
    }

    /// Stop the I/O actors, wait up to 1500 ms for them to drain, fail every letter that
    ///  never completed, and report the disconnect if the channel had been ready.
    ///  Idempotent per connection.
    pub(crate) async fn shutdown(&self, reason: DisconnectReason, mut runtime: ConnectionRuntime) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        let was_ready = self.ready.swap(false, Ordering::AcqRel);
        debug!(binding = ?self.binding, "shutting down: {:?}", reason);

        let _ = runtime.cancel.send(true);
        runtime.heartbeat.abort();

        let drain = async {
            let _ = (&mut runtime.receiver).await;
            let _ = (&mut runtime.transmitter).await;
        };
        if timeout(SHUTDOWN_DRAIN_TIMEOUT, drain).await.is_err() {
            warn!(binding = ?self.binding, "i/o actors did not drain in time - aborting them");
            runtime.receiver.abort();
            runtime.transmitter.abort();
        }

        let undelivered = {
            let mut proto = self.proto.lock();
            proto.transmitter = None;
            proto.cause = None;
            proto.incoming_ack_queue.clear();
            proto.pending_ack_queue.drain(..).collect::<Vec<_>>()
        };
        for letter in undelivered {
            match letter.letter_type {
                LetterType::User | LetterType::Batch => self.fail(letter),
                _ => {}
            }
        }

        if was_ready {
            self.emit(ChannelEvent::Disconnected { binding: self.binding, reason });
        }
    }

    #[cfg(test)]
    pub(crate) fn initialization_count(&self) -> u8 {
        self.proto.lock().initialization_count
    }
}

/// Ticker task: one heartbeat letter per idle interval on a ready channel. Any send or
///  receive since the previous tick counts as activity and suppresses the probe.
async fn heartbeat_loop(channel: Arc<Channel>, mut cancelled: watch::Receiver<bool>) {
    let mut ticker = interval(channel.config.heartbeat_interval);
    loop {
        select! {
            _ = cancelled.changed() => return,
            _ = ticker.tick() => {}
        }
        if !channel.is_ready() {
            continue;
        }
        if channel.activity.swap(false, Ordering::AcqRel) {
            continue;
        }
        trace!(binding = ?channel.binding, "idle, sending heartbeat");
        if let Some(transmitter) = &channel.proto.lock().transmitter {
            transmitter.enqueue(Letter::heartbeat());
        }
    }
}

/// Supervising task of an outbound channel: dial, run the connection until its first
///  failure cause, shut down, back off, redial. Queue state is reset on every new
///  connection; only a requested disposal ends the loop.
pub(crate) async fn run_outbound(channel: Arc<Channel>, mut dispose: watch::Receiver<bool>) {
    loop {
        if *dispose.borrow() {
            break;
        }
        let connect = select! {
            _ = dispose.changed() => break,
            connect = TcpStream::connect(channel.binding) => connect,
        };
        match connect {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                let (reader, writer) = stream.into_split();
                let mut runtime = channel.connected(reader, writer);
                let reason = select! {
                    _ = dispose.changed() => DisconnectReason::Requested,
                    cause = runtime.cause_rx.recv() => cause.unwrap_or(DisconnectReason::Socket),
                };
                channel.shutdown(reason, runtime).await;
                if reason == DisconnectReason::Requested {
                    break;
                }
            }
            Err(e) => {
                debug!(binding = ?channel.binding, "connect failed: {}", e);
            }
        }
        select! {
            _ = dispose.changed() => break,
            _ = sleep(channel.config.reconnect_delay) => {}
        }
    }
    channel.emit(ChannelEvent::Terminated { binding: channel.binding });
}

/// Supervising task of an inbound channel: one connection, no redial.
pub(crate) async fn run_inbound(channel: Arc<Channel>, stream: TcpStream, mut dispose: watch::Receiver<bool>) {
    let _ = stream.set_nodelay(true);
    let (reader, writer) = stream.into_split();
    let mut runtime = channel.connected(reader, writer);

    let reason = if *dispose.borrow() {
        DisconnectReason::Requested
    }
    else {
        select! {
            _ = dispose.changed() => DisconnectReason::Requested,
            cause = runtime.cause_rx.recv() => cause.unwrap_or(DisconnectReason::Socket),
        }
    };
    channel.shutdown(reason, runtime).await;
    channel.emit(ChannelEvent::Terminated { binding: channel.binding });
}
