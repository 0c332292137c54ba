//! # Utility Modules
//!
//! Supporting utilities for cryptography, logging, metrics and timing.
//!
//! ## Components
//! - **Crypto**: per-mode ChaCha20-Poly1305 cipher providers
//! - **Logging**: optional subscriber setup from [`crate::config::LoggingConfig`]
//! - **Metrics**: thread-safe engine counters
//! - **Timeout**: deadline and cancellation wrappers for suspension points
//!
//! ## Security
//! - Nonces come from the OS RNG (getrandom)
//! - Key material is zeroed after the AEAD is keyed (zeroize crate)

pub mod crypto;
pub mod logging;
pub mod metrics;
pub mod timeout;

pub use crypto::{cipher_for, Cipher};
pub use metrics::{Metrics, MetricsSnapshot};
