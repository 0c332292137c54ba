//! Per-connection state handed from a listener or dialer to the engine.
//!
//! A [`ConnectionContext`] owns the live transport for exactly one cycle and
//! carries the unit's cancellation token and per-operation timeout. Every I/O
//! helper here races its operation against both.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{TransportKind, MAX_UDP_BUFFER_SIZE};
use crate::error::{ProtocolError, Result};
use crate::transport::stream::{boxed, BoxedStream, IoStream};
use crate::utils::timeout::guarded;

/// The live transport of one cycle
pub enum Transport {
    /// Plain TCP or TLS, buffered for non-blocking readiness checks
    Stream(BufReader<BoxedStream>),
    /// A datagram socket and the peer it talks to
    Datagram {
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        /// Datagram already read by a listener for this unit
        pending: Option<Bytes>,
    },
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Stream(_) => f.write_str("Stream"),
            Transport::Datagram { peer, pending, .. } => f
                .debug_struct("Datagram")
                .field("peer", peer)
                .field("pending", &pending.as_ref().map(Bytes::len))
                .finish(),
        }
    }
}

/// Transport plus the cancellation and timeout policy of one cycle
#[derive(Debug)]
pub struct ConnectionContext {
    transport: Transport,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    cancel: CancellationToken,
    op_timeout: Duration,
    buffer_size: usize,
    /// This side opened the connection
    initiator: bool,
}

impl ConnectionContext {
    /// Context over a connected stream
    pub fn stream<S: IoStream + 'static>(
        stream: S,
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
        cancel: CancellationToken,
        op_timeout: Duration,
    ) -> Self {
        Self::boxed_stream(boxed(stream), local_addr, peer_addr, cancel, op_timeout)
    }

    /// Context over an already type-erased stream
    pub fn boxed_stream(
        stream: BoxedStream,
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
        cancel: CancellationToken,
        op_timeout: Duration,
    ) -> Self {
        Self {
            transport: Transport::Stream(BufReader::new(stream)),
            local_addr,
            peer_addr,
            cancel,
            op_timeout,
            buffer_size: MAX_UDP_BUFFER_SIZE,
            initiator: false,
        }
    }

    /// Context over a datagram socket talking to `peer`
    pub fn datagram(
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        pending: Option<Bytes>,
        cancel: CancellationToken,
        op_timeout: Duration,
    ) -> Self {
        let local_addr = socket.local_addr().ok();
        Self {
            transport: Transport::Datagram {
                socket,
                peer,
                pending,
            },
            local_addr,
            peer_addr: Some(peer),
            cancel,
            op_timeout,
            buffer_size: MAX_UDP_BUFFER_SIZE,
            initiator: false,
        }
    }

    /// Endpoint buffer size: the largest datagram sent or received
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Mark this side as the one that opened the connection.
    ///
    /// In a bidirectional exchange the initiator yields when both peers
    /// start sending at once.
    pub fn initiated(mut self) -> Self {
        self.initiator = true;
        self
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn kind(&self) -> TransportKind {
        match self.transport {
            Transport::Stream(_) => TransportKind::Tcp,
            Transport::Datagram { .. } => TransportKind::Udp,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn op_timeout(&self) -> Duration {
        self.op_timeout
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn stream_mut(&mut self) -> Result<&mut BufReader<BoxedStream>> {
        match &mut self.transport {
            Transport::Stream(stream) => Ok(stream),
            Transport::Datagram { .. } => Err(ProtocolError::InvalidState(
                crate::error::constants::ERR_TRANSPORT_MISMATCH,
            )),
        }
    }

    /// Write and flush `bytes`
    pub async fn write_frame(&mut self, bytes: &[u8]) -> Result<()> {
        let timeout = self.op_timeout;
        let cancel = self.cancel.clone();
        let stream = self.stream_mut()?;
        guarded(
            async {
                stream.write_all(bytes).await.map_err(ProtocolError::from_io)?;
                stream.flush().await.map_err(ProtocolError::from_io)
            },
            timeout,
            &cancel,
        )
        .await
    }

    /// Read exactly `len` bytes within `timeout`
    pub async fn read_frame(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>> {
        let cancel = self.cancel.clone();
        let stream = self.stream_mut()?;
        let mut frame = vec![0u8; len];
        guarded(
            async {
                stream
                    .read_exact(&mut frame)
                    .await
                    .map_err(ProtocolError::from_io)
            },
            timeout,
            &cancel,
        )
        .await?;
        Ok(frame)
    }

    /// One read of at most `buf.len()` bytes; `Ok(0)` means the peer closed
    pub async fn read_chunk(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let cancel = self.cancel.clone();
        let stream = self.stream_mut()?;
        guarded(
            async { stream.read(buf).await.map_err(ProtocolError::from_io) },
            timeout,
            &cancel,
        )
        .await
    }

    /// Whether inbound bytes arrive within `timeout`, without consuming them.
    ///
    /// Fails with `ConnectionClosed` when the peer has shut down its side.
    pub async fn poll_readable(&mut self, timeout: Duration) -> Result<bool> {
        let cancel = self.cancel.clone();
        let stream = self.stream_mut()?;
        let peeked = guarded(
            async {
                stream
                    .fill_buf()
                    .await
                    .map(|buf| buf.len())
                    .map_err(ProtocolError::from_io)
            },
            timeout,
            &cancel,
        )
        .await;
        match peeked {
            Ok(0) => Err(ProtocolError::ConnectionClosed),
            Ok(_) => Ok(true),
            Err(ProtocolError::Timeout) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Take the datagram a listener already received for this unit
    pub fn take_pending(&mut self) -> Option<Bytes> {
        match &mut self.transport {
            Transport::Datagram { pending, .. } => pending.take(),
            Transport::Stream(_) => None,
        }
    }

    /// Send one datagram to the peer
    pub async fn send_datagram(&self, bytes: &[u8]) -> Result<()> {
        let Transport::Datagram { socket, peer, .. } = &self.transport else {
            return Err(ProtocolError::InvalidState(
                crate::error::constants::ERR_TRANSPORT_MISMATCH,
            ));
        };
        guarded(
            async {
                socket
                    .send_to(bytes, *peer)
                    .await
                    .map_err(ProtocolError::from_io)
            },
            self.op_timeout,
            &self.cancel,
        )
        .await?;
        Ok(())
    }

    /// Receive one datagram of at most `max_len` bytes, trimmed to its size
    pub async fn recv_datagram(&mut self, max_len: usize, timeout: Duration) -> Result<Bytes> {
        let Transport::Datagram { socket, peer, .. } = &mut self.transport else {
            return Err(ProtocolError::InvalidState(
                crate::error::constants::ERR_TRANSPORT_MISMATCH,
            ));
        };
        let mut buf = vec![0u8; max_len];
        let (len, from) = guarded(
            async { socket.recv_from(&mut buf).await.map_err(ProtocolError::from_io) },
            timeout,
            &self.cancel,
        )
        .await?;
        *peer = from;
        self.peer_addr = Some(from);
        buf.truncate(len);
        Ok(Bytes::from(buf))
    }

    /// Shut the stream down and drop the handle. Errors from an already
    /// closed peer are ignored.
    pub async fn close(self) {
        if let Transport::Stream(mut stream) = self.transport {
            match tokio::time::timeout(self.op_timeout, stream.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "Stream shutdown after peer close"),
                Err(_) => debug!("Stream shutdown timed out"),
            }
        }
    }
}
