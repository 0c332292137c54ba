//! # socket-engine
//!
//! A TCP/UDP socket engine implementing an acknowledged, length-prefixed
//! application protocol with optional transport encryption.
//!
//! ## Components
//! - **Listener**: binds an endpoint and runs accept/receive cycles, serially
//!   or fanned out across tasks behind an admission gate
//! - **Dialer**: connects outbound, optionally through SOCKS5 and TLS
//! - **ProtocolEngine**: ACK exchange, amount-bytes handshake, chunked I/O
//!   and message routing through message boxes
//! - **Cipher**: per-mode ChaCha20-Poly1305 providers with a fixed overhead
//!
//! ## Example Usage
//! ```rust,no_run
//! use socket_engine::{
//!     CommunicationType, EndpointConfig, Listener, MessageBoxes, ProtocolEngine,
//!     ServerOptions, TaskConfig,
//! };
//!
//! # async fn run() -> socket_engine::Result<()> {
//! let endpoint = EndpointConfig::tcp("127.0.0.1", 9000, 1500, 1000, 1)?;
//! let boxes = MessageBoxes::single(64);
//! let engine = ProtocolEngine::new(TaskConfig::new(CommunicationType::TcpReceive), boxes.clone())?;
//!
//! let listener = Listener::new(endpoint, engine, ServerOptions::default())?;
//! let summary = listener.run_socket().await?;
//! assert!(summary.limit_reached);
//! # Ok(())
//! # }
//! ```
//!
//! The engine only emits `tracing` events. Hosts install a subscriber,
//! for example with [`utils::logging::init_logging`].

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod queue;
pub mod service;
pub mod transport;
pub mod utils;

pub use config::{
    Cardinality, CommunicationType, DialerOptions, EndpointConfig, EngineConfig, ProxyConfig,
    RetryPolicy, SecurityMode, ServerOptions, TaskConfig, TlsSettings, TransportKind,
};
pub use crate::core::envelope::Message;
pub use error::{ErrorCategory, ProtocolError, Result};
pub use protocol::context::ConnectionContext;
pub use protocol::engine::{EngineState, ProtocolEngine, TaskReport, TransferProgress};
pub use queue::{MessageBox, MessageBoxes};
pub use service::dialer::Dialer;
pub use service::gate::{AdmissionGate, Ticket};
pub use service::listener::Listener;
pub use service::{RunControl, RunSummary};
