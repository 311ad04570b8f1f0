use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::transport::channel::{run_inbound, run_outbound, Channel, ChannelDirection};
use crate::transport::channel_events::ChannelEvent;
use crate::transport::socket_config::SocketConfig;

/// Owns every channel of one socket, keyed by binding. Outbound channels survive
///  transient disconnects (their supervising task keeps redialing); inbound channels are
///  forgotten when their connection ends. Every channel reports into the same event
///  stream, consumed by the socket's dispatcher.
pub(crate) struct ChannelFleet {
    config: Arc<SocketConfig>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    channels: Arc<Mutex<FxHashMap<SocketAddr, Arc<Channel>>>>,
    dispose: watch::Sender<bool>,
}

impl ChannelFleet {
    pub fn new(config: Arc<SocketConfig>, events: mpsc::UnboundedSender<ChannelEvent>) -> ChannelFleet {
        ChannelFleet {
            config,
            events,
            channels: Arc::new(Mutex::new(FxHashMap::default())),
            dispose: watch::channel(false).0,
        }
    }

    /// Open a listener; every accepted connection becomes an inbound channel. Returns the
    ///  actually bound address, so `addr` may carry port 0.
    pub async fn bind(&self, addr: SocketAddr) -> anyhow::Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = ?local_addr, "listening");

        let config = self.config.clone();
        let events = self.events.clone();
        let channels = self.channels.clone();
        let mut dispose = self.dispose.subscribe();
        tokio::spawn(async move {
            loop {
                let accepted = select! {
                    _ = dispose.changed() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, peer_addr)) => {
                        debug!(?peer_addr, "accepted connection");
                        let channel = Channel::new(
                            peer_addr,
                            ChannelDirection::Inbound,
                            config.clone(),
                            events.clone(),
                        );
                        channels.lock().insert(peer_addr, channel.clone());
                        tokio::spawn(run_inbound(channel, stream, dispose.clone()));
                    }
                    Err(e) => warn!("accept failed: {}", e),
                }
            }
            debug!(addr = ?local_addr, "listener closed");
        });

        Ok(local_addr)
    }

    /// Register an outbound channel and start dialing. One channel per binding: a second
    ///  connect to the same binding is a no-op.
    pub fn connect(&self, binding: SocketAddr) {
        let channel = {
            let mut channels = self.channels.lock();
            if channels.contains_key(&binding) {
                debug!(?binding, "a channel for this binding already exists");
                return;
            }
            let channel = Channel::new(
                binding,
                ChannelDirection::Outbound,
                self.config.clone(),
                self.events.clone(),
            );
            channels.insert(binding, channel.clone());
            channel
        };
        tokio::spawn(run_outbound(channel, self.dispose.subscribe()));
    }

    /// snapshot of the channels that can carry traffic right now
    pub fn ready_channels(&self) -> Vec<Arc<Channel>> {
        self.channels.lock().values().filter(|c| c.is_ready()).cloned().collect()
    }

    pub fn remove(&self, binding: &SocketAddr) {
        self.channels.lock().remove(binding);
    }

    pub fn is_empty(&self) -> bool {
        self.channels.lock().is_empty()
    }

    pub fn disposed(&self) -> watch::Receiver<bool> {
        self.dispose.subscribe()
    }

    /// requested shutdown for every channel and listener; idempotent
    pub fn dispose(&self) {
        let _ = self.dispose.send(true);
    }
}
