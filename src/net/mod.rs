//! Sockets and framing.
//!
//! - [`acceptor`]: the listening socket and round-robin handoff to reader loops
//! - [`client`]: outbound connections owned by a writer loop
//! - [`connection`]: one socket with its read decoder and write queue
//! - [`codec`]: the length-prefixed wire format

pub mod acceptor;
pub mod client;
pub mod codec;
pub mod connection;
