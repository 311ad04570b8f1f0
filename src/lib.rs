pub mod transport;
pub mod util;

#[cfg(test)]
pub mod test_util;

pub use transport::channel::{Channel, ChannelDirection};
pub use transport::channel_events::{DisconnectReason, SocketEvent};
pub use transport::letter::{Letter, LetterOptions, LetterType};
pub use transport::node_id::NodeId;
pub use transport::socket_config::SocketConfig;
pub use transport::unicast_socket::UnicastSocket;
pub use transport::wire_error::WireError;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
