//! # Protocol Engine
//!
//! Drives the wire protocol over one attached [`ConnectionContext`].
//!
//! The engine is configured once (task settings, cipher, message boxes) and
//! then cloned per peer with [`ProtocolEngine::fresh`], which keeps the
//! configuration and resets everything tied to a connection.
//!
//! ## Lifecycle
//! ```text
//! Created --validate--> Validated --run_task--> Running --close--> Closed
//!    ^                                                               |
//!    +------------------------- attach -----------------------------+
//! ```
//! Cancellation moves any state straight to `Closed`.
//!
//! ## Wire primitives
//! - ACK: the sentinel `0xA5`, encrypted under a security mode
//! - amount-bytes handshake: size indicator, ACK, big-endian length, ACK
//! - chunked payload transfer with a tolerance loop for short reads
//!
//! Message-level operations built on these live in `messaging.rs`.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, instrument, trace, warn};

use crate::config::{
    Cardinality, CommunicationType, TaskConfig, ACK_SENTINEL, PROGRESS_INTERVAL_BYTES,
};
use crate::core::length;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::context::ConnectionContext;
use crate::queue::MessageBoxes;
use crate::utils::crypto::{cipher_for, Cipher};
use crate::utils::metrics::Metrics;
use crate::utils::timeout::sleep_or_cancel;

/// Receives transfer progress reports
pub type ProgressCallback = Arc<dyn Fn(TransferProgress) + Send + Sync>;

/// Direction of a payload transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Progress of one payload transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub direction: Direction,
    /// Bytes moved so far
    pub transferred: u64,
    /// Expected total, if known
    pub total: Option<u64>,
}

/// How an ACK wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AckOutcome {
    Acked,
    /// The peer sent its own size indicator instead
    PeerSending(u8),
}

/// Per-connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Validated,
    Running,
    Closed,
}

/// Counters for one run of a task
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskReport {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// ACK and size-indicator reads that were retried
    pub retries: u64,
}

/// Reports progress every time another [`PROGRESS_INTERVAL_BYTES`] have moved
struct ProgressTracker {
    direction: Direction,
    total: Option<u64>,
    transferred: u64,
    last_reported: u64,
}

impl ProgressTracker {
    fn new(direction: Direction, total: Option<u64>) -> Self {
        Self {
            direction,
            total,
            transferred: 0,
            last_reported: 0,
        }
    }

    fn advance(&mut self, bytes: usize, callback: Option<&ProgressCallback>) {
        self.transferred += bytes as u64;
        if self.transferred - self.last_reported < PROGRESS_INTERVAL_BYTES {
            return;
        }
        self.last_reported = self.transferred;
        if let Some(callback) = callback {
            callback(TransferProgress {
                direction: self.direction,
                transferred: self.transferred,
                total: self.total,
            });
        }
    }
}

/// The protocol engine
pub struct ProtocolEngine {
    pub(crate) task: TaskConfig,
    pub(crate) cipher: Arc<dyn Cipher>,
    pub(crate) boxes: MessageBoxes,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) progress: Option<ProgressCallback>,
    pub(crate) ctx: Option<ConnectionContext>,
    pub(crate) state: EngineState,
    pub(crate) report: TaskReport,
}

impl fmt::Debug for ProtocolEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolEngine")
            .field("task", &self.task)
            .field("boxes", &self.boxes.len())
            .field("state", &self.state)
            .field("ctx", &self.ctx)
            .finish_non_exhaustive()
    }
}

/// The attached context, or `InvalidState` if none is attached
pub(crate) fn connected(ctx: &mut Option<ConnectionContext>) -> Result<&mut ConnectionContext> {
    ctx.as_mut()
        .ok_or(ProtocolError::InvalidState(constants::ERR_NOT_CONNECTED))
}

impl ProtocolEngine {
    /// Build an engine template.
    ///
    /// Validates the task and selects the cipher once; fails with a
    /// configuration error.
    pub fn new(task: TaskConfig, boxes: MessageBoxes) -> Result<Self> {
        task.validate_strict()?;
        let cipher = cipher_for(task.security, task.passphrase.as_deref())?;
        Ok(Self {
            task,
            cipher,
            boxes,
            metrics: Arc::new(Metrics::new()),
            progress: None,
            ctx: None,
            state: EngineState::Created,
            report: TaskReport::default(),
        })
    }

    /// Share a metrics collector with the owning listener or dialer
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Install a progress callback for payload transfers
    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(TransferProgress) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(callback));
        self
    }

    /// Copy for a new peer: configuration, cipher, boxes, metrics and
    /// callback are kept; context, state and counters start over.
    pub fn fresh(&self) -> Self {
        Self {
            task: self.task.clone(),
            cipher: Arc::clone(&self.cipher),
            boxes: self.boxes.clone(),
            metrics: Arc::clone(&self.metrics),
            progress: self.progress.clone(),
            ctx: None,
            state: EngineState::Created,
            report: TaskReport::default(),
        }
    }

    pub fn task(&self) -> &TaskConfig {
        &self.task
    }

    pub fn boxes(&self) -> &MessageBoxes {
        &self.boxes
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn report(&self) -> &TaskReport {
        &self.report
    }

    pub fn context(&self) -> Option<&ConnectionContext> {
        self.ctx.as_ref()
    }

    /// Attach the transport for the next run
    pub fn attach(&mut self, ctx: ConnectionContext) -> Result<()> {
        if matches!(self.state, EngineState::Running | EngineState::Validated) {
            return Err(ProtocolError::InvalidState(constants::ERR_TASK_RUNNING));
        }
        self.ctx = Some(ctx);
        self.state = EngineState::Created;
        self.report = TaskReport::default();
        Ok(())
    }

    /// Check the attached transport, message boxes and buffer length
    pub fn validate(&mut self) -> Result<()> {
        match self.state {
            EngineState::Closed => {
                return Err(ProtocolError::InvalidState(constants::ERR_ALREADY_CLOSED))
            }
            EngineState::Running => {
                return Err(ProtocolError::InvalidState(constants::ERR_TASK_RUNNING))
            }
            EngineState::Created | EngineState::Validated => {}
        }

        let ctx = self
            .ctx
            .as_ref()
            .ok_or(ProtocolError::InvalidState(constants::ERR_NOT_CONNECTED))?;

        let transport = self.task.communication.transport();
        if ctx.kind() != transport {
            return Err(ProtocolError::InvalidState(
                constants::ERR_TRANSPORT_MISMATCH,
            ));
        }

        let required_boxes = match self.task.cardinality {
            Cardinality::EqualBidirectional => 2,
            Cardinality::OneToOne | Cardinality::ManyToOne => 1,
        };
        if self.boxes.len() < required_boxes {
            return Err(ProtocolError::InvalidState(constants::ERR_BOX_COUNT));
        }

        if self.task.buffer_length < transport.min_buffer_size() {
            return Err(ProtocolError::InvalidState(constants::ERR_BUFFER_TOO_SMALL));
        }

        self.state = EngineState::Validated;
        Ok(())
    }

    /// Run the configured communication type once over the attached context
    #[instrument(
        skip(self),
        fields(
            communication = ?self.task.communication,
            peer = ?self.ctx.as_ref().and_then(|c| c.peer_addr())
        )
    )]
    pub async fn run_task(&mut self) -> Result<TaskReport> {
        match self.state {
            EngineState::Closed => {
                return Err(ProtocolError::InvalidState(constants::ERR_ALREADY_CLOSED))
            }
            EngineState::Running => {
                return Err(ProtocolError::InvalidState(constants::ERR_TASK_RUNNING))
            }
            EngineState::Created => self.validate()?,
            EngineState::Validated => {}
        }
        self.state = EngineState::Running;

        match self.dispatch().await {
            Ok(()) => {
                trace!(report = ?self.report, "Task finished");
                Ok(self.report.clone())
            }
            Err(ProtocolError::Cancelled) => {
                debug!("Task cancelled");
                self.close().await;
                Err(ProtocolError::Cancelled)
            }
            Err(e) => Err(e),
        }
    }

    async fn dispatch(&mut self) -> Result<()> {
        match self.task.communication {
            CommunicationType::TcpSend => {
                let message = self.next_outbound().await?;
                self.tcp_send(&message).await
            }
            CommunicationType::TcpSendWithAnswer => {
                let message = self.next_outbound().await?;
                self.tcp_send(&message).await?;
                self.tcp_receive().await.map(|_| ())
            }
            CommunicationType::TcpReceive => self.tcp_receive().await.map(|_| ()),
            CommunicationType::TcpReceiveWithAnswer => {
                self.tcp_receive().await?;
                let answer = self.next_outbound().await?;
                self.tcp_send(&answer).await
            }
            CommunicationType::TcpBidirectional => self.tcp_bidirectional().await,
            CommunicationType::UdpSend | CommunicationType::UdpSendWithAck => {
                let with_ack = self.task.communication == CommunicationType::UdpSendWithAck;
                let message = self.next_outbound().await?;
                self.udp_send(&message, with_ack).await
            }
            CommunicationType::UdpReceive | CommunicationType::UdpReceiveWithAck => {
                let with_ack = self.task.communication == CommunicationType::UdpReceiveWithAck;
                self.udp_receive(with_ack).await.map(|_| ())
            }
        }
    }

    /// Tear down the attached context and move to `Closed`
    pub async fn close(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            ctx.close().await;
        }
        self.state = EngineState::Closed;
    }

    fn record_retry(&mut self) {
        self.report.retries += 1;
        self.metrics.protocol_retry();
    }

    /// Send the (possibly encrypted) ACK sentinel
    pub async fn send_ack(&mut self) -> Result<()> {
        let frame = self.cipher.encrypt(&[ACK_SENTINEL])?;
        let ctx = connected(&mut self.ctx)?;
        match ctx.kind() {
            crate::config::TransportKind::Tcp => ctx.write_frame(&frame).await,
            crate::config::TransportKind::Udp => ctx.send_datagram(&frame).await,
        }
    }

    /// Wait for the ACK sentinel.
    ///
    /// A frame that is not the sentinel is retried after the retry delay, up
    /// to the policy's retry count, then fails with `AckMismatch`. Timeouts
    /// and a closed peer fail immediately.
    pub async fn receive_ack(&mut self) -> Result<()> {
        self.await_ack(false).await.map(|_| ())
    }

    /// ACK wait that, when `contended`, recognises the peer's own size
    /// indicator: the initiator yields to it, the other side drops it and
    /// keeps waiting.
    async fn await_ack(&mut self, contended: bool) -> Result<AckOutcome> {
        let policy = self.task.retry;
        let frame_len = 1 + self.cipher.overhead();
        let mut retries = 0u32;
        let mut dropped = 0u32;

        loop {
            let ctx = connected(&mut self.ctx)?;
            let timeout = ctx.op_timeout();
            let cancel = ctx.cancel_token().clone();
            let initiator = ctx.is_initiator();
            let frame = match ctx.kind() {
                crate::config::TransportKind::Tcp => ctx.read_frame(frame_len, timeout).await?,
                crate::config::TransportKind::Udp => {
                    ctx.recv_datagram(frame_len.max(64), timeout).await?.to_vec()
                }
            };

            let plain = if frame.len() == frame_len {
                self.cipher.decrypt(&frame).ok()
            } else {
                None
            };
            match plain.as_deref() {
                Some([ACK_SENTINEL]) => return Ok(AckOutcome::Acked),
                Some([class]) if contended && length::is_valid_indicator(*class) => {
                    if initiator {
                        debug!(class, "Peer is sending, yielding");
                        return Ok(AckOutcome::PeerSending(*class));
                    }
                    if dropped < policy.retries {
                        dropped += 1;
                        debug!(class, "Peer is sending, keeping the turn");
                        continue;
                    }
                }
                _ => {}
            }

            if retries >= policy.retries {
                warn!(retries, "ACK mismatch, giving up");
                return Err(ProtocolError::AckMismatch { retries });
            }
            retries += 1;
            self.record_retry();
            debug!(retries, "ACK mismatch, retrying");
            if !sleep_or_cancel(policy.delay, &cancel).await {
                return Err(ProtocolError::Cancelled);
            }
        }
    }

    /// Amount-bytes handshake.
    ///
    /// `amount > 0` sends that length and returns it; `amount <= 0` receives
    /// a length from the peer and returns it.
    pub async fn amount_bytes_protocol(&mut self, amount: i64) -> Result<u32> {
        if amount <= 0 {
            return self.receive_amount().await;
        }
        let amount = u32::try_from(amount)
            .map_err(|_| ProtocolError::OversizedPacket(usize::try_from(amount).unwrap_or(usize::MAX)))?;
        self.send_amount(amount).await?;
        Ok(amount)
    }

    /// Sender half of the amount-bytes handshake
    pub async fn send_amount(&mut self, amount: u32) -> Result<()> {
        self.offer_amount(amount, false).await.map(|_| ())
    }

    /// Send a length, or give way to the peer's when `contended` and this
    /// side is the initiator. Returns the peer's size indicator on yield.
    pub(crate) async fn offer_amount(
        &mut self,
        amount: u32,
        contended: bool,
    ) -> Result<Option<u8>> {
        let class = length::size_class(amount);

        let indicator = self.cipher.encrypt(&[class])?;
        connected(&mut self.ctx)?.write_frame(&indicator).await?;
        if let AckOutcome::PeerSending(theirs) = self.await_ack(contended).await? {
            return Ok(Some(theirs));
        }

        let value = self.cipher.encrypt(&length::encode_amount(amount))?;
        connected(&mut self.ctx)?.write_frame(&value).await?;
        self.receive_ack().await?;

        trace!(amount, class, "Length sent");
        Ok(None)
    }

    /// Receiver half of the amount-bytes handshake
    pub async fn receive_amount(&mut self) -> Result<u32> {
        self.receive_amount_after(None).await
    }

    /// Receive a length whose size indicator may already have been read
    pub(crate) async fn receive_amount_after(&mut self, indicator: Option<u8>) -> Result<u32> {
        let indicator = match indicator {
            Some(indicator) => indicator,
            None => self.receive_size_indicator().await?,
        };
        self.send_ack().await?;

        let frame_len = indicator as usize + self.cipher.overhead();
        let ctx = connected(&mut self.ctx)?;
        let timeout = ctx.op_timeout();
        let frame = ctx.read_frame(frame_len, timeout).await?;
        let plain = self.cipher.decrypt(&frame)?;
        if plain.len() != indicator as usize {
            return Err(ProtocolError::InvalidSizeIndicator { retries: 0 });
        }
        let amount = length::decode_amount(&plain)?;
        self.send_ack().await?;

        trace!(amount, class = indicator, "Length received");
        Ok(amount)
    }

    /// Read the one-byte size indicator.
    ///
    /// Zero, out-of-range, undecryptable and timed-out reads are retried with
    /// the policy's delay; exhaustion fails with `InvalidSizeIndicator`.
    async fn receive_size_indicator(&mut self) -> Result<u8> {
        let policy = self.task.retry;
        let frame_len = 1 + self.cipher.overhead();
        let mut retries = 0u32;

        loop {
            let ctx = connected(&mut self.ctx)?;
            let timeout = ctx.op_timeout();
            let cancel = ctx.cancel_token().clone();
            let indicator = match ctx.read_frame(frame_len, timeout).await {
                Ok(frame) => match self.cipher.decrypt(&frame).as_deref() {
                    Ok([class]) if length::is_valid_indicator(*class) => Some(*class),
                    _ => None,
                },
                Err(ProtocolError::Timeout) => None,
                Err(e) => return Err(e),
            };

            if let Some(indicator) = indicator {
                return Ok(indicator);
            }

            if retries >= policy.retries {
                warn!(retries, "Invalid size indicator, giving up");
                return Err(ProtocolError::InvalidSizeIndicator { retries });
            }
            retries += 1;
            self.record_retry();
            debug!(retries, "Invalid size indicator, retrying");
            if !sleep_or_cancel(policy.delay, &cancel).await {
                return Err(ProtocolError::Cancelled);
            }
        }
    }

    /// Write `data` in `buffer_len`-sized chunks, flushing each
    pub async fn send_bytes(&mut self, data: &[u8], buffer_len: usize) -> Result<()> {
        if buffer_len == 0 {
            return Err(ProtocolError::InvalidState(constants::ERR_BUFFER_TOO_SMALL));
        }
        let mut tracker = ProgressTracker::new(Direction::Outbound, Some(data.len() as u64));
        let ctx = connected(&mut self.ctx)?;
        for chunk in data.chunks(buffer_len) {
            ctx.write_frame(chunk).await?;
            tracker.advance(chunk.len(), self.progress.as_ref());
        }
        Ok(())
    }

    /// Read up to `amount` bytes (the unknown-size cap when `None`) in
    /// `buffer_len`-sized chunks.
    ///
    /// A short read starts the tolerance window: reads with the short
    /// `tolerance_delay` timeout, ending after `tolerance_cycles` of them in a
    /// row deliver nothing. A known-size transfer that resumes goes back to
    /// full-timeout reads. An unknown-size transfer stays in the window after
    /// its first data, since only the window can tell that delivery ended.
    /// The result holds exactly the bytes received.
    pub async fn receive_bytes(
        &mut self,
        amount: Option<usize>,
        buffer_len: usize,
    ) -> Result<Vec<u8>> {
        if buffer_len == 0 {
            return Err(ProtocolError::InvalidState(constants::ERR_BUFFER_TOO_SMALL));
        }
        let cap = self.task.max_unknown_size();
        let target = match amount {
            Some(n) if n > cap => return Err(ProtocolError::OversizedPacket(n)),
            Some(n) => n,
            None => cap,
        };
        let cycles = self.task.tolerance_cycles;
        let delay = self.task.tolerance_delay;

        let mut received = Vec::with_capacity(target.min(buffer_len.saturating_mul(16)));
        let mut chunk = vec![0u8; buffer_len.min(target.max(1))];
        let mut tracker = ProgressTracker::new(Direction::Inbound, amount.map(|n| n as u64));
        let ctx = connected(&mut self.ctx)?;
        let timeout = ctx.op_timeout();

        'transfer: while received.len() < target {
            let want = chunk.len().min(target - received.len());
            let n = ctx.read_chunk(&mut chunk[..want], timeout).await?;
            if n == 0 {
                break;
            }
            received.extend_from_slice(&chunk[..n]);
            tracker.advance(n, self.progress.as_ref());

            if amount.is_some() && n == want {
                continue;
            }

            let mut idle = 0;
            while received.len() < target {
                if idle >= cycles {
                    if amount.is_some() {
                        debug!(received = received.len(), target, "Transfer ended early");
                    } else {
                        trace!(received = received.len(), "Unknown-size transfer complete");
                    }
                    break 'transfer;
                }
                let want = chunk.len().min(target - received.len());
                match ctx.read_chunk(&mut chunk[..want], delay).await {
                    Ok(0) => break 'transfer,
                    Ok(m) => {
                        received.extend_from_slice(&chunk[..m]);
                        tracker.advance(m, self.progress.as_ref());
                        idle = 0;
                        if amount.is_some() {
                            continue 'transfer;
                        }
                    }
                    Err(ProtocolError::Timeout) => {
                        trace!(cycle = idle, "Tolerance cycle without data");
                        idle += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(received)
    }
}
