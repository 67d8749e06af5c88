pub mod admission;
pub mod allowlist;
pub mod client;
pub mod error;
pub mod handshake;
pub mod relay;
pub mod server;
pub mod session;
pub mod stream;
