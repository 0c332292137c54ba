//! Type-erased byte streams.
//!
//! Plain TCP, TLS over TCP and TLS over a SOCKS5 tunnel all end up as a
//! [`BoxedStream`], so the protocol engine has a single stream type to drive.

use tokio::io::{AsyncRead, AsyncWrite};

/// Anything the engine can read from and write to
pub trait IoStream: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync> IoStream for T {}

/// Owned, type-erased stream
pub type BoxedStream = Box<dyn IoStream>;

/// Erase the concrete stream type
pub fn boxed<S: IoStream + 'static>(stream: S) -> BoxedStream {
    Box::new(stream)
}
