pub mod channel;
pub mod channel_events;
pub mod channel_fleet;
pub mod letter;
pub mod letter_receiver;
pub mod letter_transmitter;
pub mod node_id;
pub mod socket_config;
pub mod unicast_socket;
pub mod wire_error;
