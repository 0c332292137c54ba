//! # Service Layer
//!
//! Socket lifecycle around the protocol engine.
//!
//! - [`listener::Listener`] binds an endpoint and runs accept/receive cycles,
//!   serially or fanned out across tokio tasks
//! - [`dialer::Dialer`] connects outbound, optionally through SOCKS5 and TLS
//! - [`gate::AdmissionGate`] bounds how many server-mode units run at once
//!
//! Both engines share a [`RunControl`] with their units. Stopping one sets
//! its stop flags and cancels the root token; every unit runs under a child
//! of that token.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use tokio_util::sync::CancellationToken;

pub mod dialer;
pub mod gate;
pub mod listener;

/// Stop flags, termination counter and root cancellation token of one engine
#[derive(Debug, Default)]
pub struct RunControl {
    stop: AtomicBool,
    server_stop: AtomicBool,
    terminations: AtomicI64,
    cancel: CancellationToken,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Explicit stop: set both flags and cancel every unit
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.server_stop.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    /// Stop taking new cycles without cancelling those in flight
    pub fn set_stopped(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Whether `stop` was called, as opposed to the limit being reached
    pub fn server_stopped(&self) -> bool {
        self.server_stop.load(Ordering::SeqCst)
    }

    /// Count one termination and return the new total
    pub fn record_termination(&self) -> i64 {
        self.terminations.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn terminations(&self) -> i64 {
        self.terminations.load(Ordering::SeqCst)
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Token for one unit, cancelled with the engine
    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }
}

/// What one `run_*` call did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Cycles that ran (terminations)
    pub cycles: u64,
    /// Cycles that ended in an error
    pub failed_cycles: u64,
    /// Units turned away by the admission gate
    pub rejected: u64,
    /// Accept or idle waits that timed out without a peer
    pub idle_timeouts: u64,
    /// Whether the run ended on the termination limit
    pub limit_reached: bool,
}
