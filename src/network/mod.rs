pub mod client;
pub mod message;
pub mod peer_connection;
pub mod peer_connection_registry;
pub mod server;
pub mod wire;
