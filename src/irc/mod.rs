pub mod admin;
pub mod backoff;
pub mod client;
pub mod codec;
pub mod connection;
pub mod message;
pub mod network;
pub mod relay;
pub mod server;
