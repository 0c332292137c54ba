//! # Transport Layer
//!
//! Socket setup for the listener and the dialer. Protocol logic never lives
//! here: every function hands back a connected stream or socket that the
//! protocol engine then drives.
//!
//! ## Components
//! - **stream**: type-erased byte stream shared by plain TCP and TLS
//! - **tcp**: listener binding and outbound connects with buffer sizing
//! - **tls**: rustls server/client configuration and handshakes
//! - **socks**: SOCKS5 client handshake for proxied dials
//! - **udp**: datagram sockets and multicast group membership

pub mod socks;
pub mod stream;
pub mod tcp;
pub mod tls;
pub mod udp;

pub use stream::{BoxedStream, IoStream};
