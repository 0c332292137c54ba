//! # Core Wire Components
//!
//! Pure encoding helpers shared by the protocol engine, the fuzz targets and
//! the benches. Nothing here performs I/O.
//!
//! ## Components
//! - **Length**: size classes and minimal big-endian encoding for the
//!   amount-bytes handshake
//! - **Envelope**: the binary message envelope carried as payload
//!
//! ## Wire Format
//! ```text
//! handshake: [N: 1 byte] ACK [length: N bytes, big-endian] ACK
//! envelope:  [box id: 2] [amount: 2] [number: 2] [type len: 1] [type] [data]
//! ```
//!
//! Under a security mode every handshake field is encrypted on its own and
//! grows by the mode's fixed overhead.

pub mod envelope;
pub mod length;
