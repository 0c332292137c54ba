//! # Protocol Layer
//!
//! The wire protocol between two peers.
//!
//! ## Components
//! - **Context**: the live transport of one cycle plus its cancellation token
//! - **Engine**: lifecycle, ACK exchange, amount-bytes handshake, chunked I/O
//! - **Messaging**: envelope send/receive and message box routing
//!
//! ## Wire Format
//! ```text
//! sender                                  receiver
//!   | -- size indicator (1 + overhead) --> |
//!   | <------------- ACK ----------------- |
//!   | -- length (N + overhead) ----------> |
//!   | <------------- ACK ----------------- |
//!   | -- payload in buffer_len chunks ---> |
//!   | <------------- ACK ----------------- |
//! ```
//! UDP carries one envelope per datagram with no framing.

pub mod context;
pub mod engine;
pub mod messaging;
