//! Message-level operations and message box routing.
//!
//! | cardinality | outbound | inbound |
//! |---|---|---|
//! | one-to-one | first box | first box |
//! | many-to-one | lowest-id non-empty box | box named by the envelope |
//! | equal-bidirectional | first box | second box |

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, instrument, trace};

use crate::config::Cardinality;
use crate::core::envelope::Message;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::engine::{connected, ProtocolEngine};
use crate::queue::MessageBox;
use crate::utils::timeout::sleep_or_cancel;

/// Poll step while waiting on several boxes at once
const MULTI_BOX_POLL: Duration = Duration::from_millis(5);

impl ProtocolEngine {
    fn box_at(&self, index: usize) -> Result<&Arc<MessageBox>> {
        self.boxes
            .at(index)
            .ok_or(ProtocolError::InvalidState(constants::ERR_BOX_COUNT))
    }

    fn unit_cancel(&self) -> tokio_util::sync::CancellationToken {
        self.ctx
            .as_ref()
            .map(|ctx| ctx.cancel_token().clone())
            .unwrap_or_default()
    }

    /// Whether an outbound message is waiting
    pub fn has_outbound(&self) -> bool {
        match self.task.cardinality {
            Cardinality::ManyToOne => self.boxes.first_non_empty().is_some(),
            Cardinality::OneToOne | Cardinality::EqualBidirectional => {
                self.boxes.at(0).is_some_and(|b| !b.is_empty())
            }
        }
    }

    /// Outbound message without waiting
    pub fn try_next_outbound(&self) -> Option<Message> {
        match self.task.cardinality {
            Cardinality::ManyToOne => self.boxes.first_non_empty()?.try_dequeue(),
            Cardinality::OneToOne | Cardinality::EqualBidirectional => {
                self.boxes.at(0)?.try_dequeue()
            }
        }
    }

    /// Outbound message, waiting up to the queue timeout
    pub async fn next_outbound(&self) -> Result<Message> {
        let cancel = self.unit_cancel();
        let timeout = self.task.queue_timeout;

        if self.task.cardinality != Cardinality::ManyToOne {
            let outbound = self.box_at(0)?;
            return tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ProtocolError::Cancelled),
                message = outbound.dequeue(timeout) => message,
            };
        }

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(message) = self.try_next_outbound() {
                return Ok(message);
            }
            if Instant::now() >= deadline {
                return Err(ProtocolError::NoMessage(self.box_at(0)?.id()));
            }
            if !sleep_or_cancel(MULTI_BOX_POLL, &cancel).await {
                return Err(ProtocolError::Cancelled);
            }
        }
    }

    /// Box a received message belongs in
    pub fn inbound_box(&self, message: &Message) -> Result<&Arc<MessageBox>> {
        match self.task.cardinality {
            Cardinality::OneToOne => self.box_at(0),
            Cardinality::ManyToOne => self.boxes.require(message.box_id),
            Cardinality::EqualBidirectional => self.box_at(1),
        }
    }

    async fn deliver(&self, message: Message) -> Result<()> {
        let cancel = self.unit_cancel();
        let inbound = self.inbound_box(&message)?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProtocolError::Cancelled),
            queued = inbound.enqueue(message, self.task.queue_timeout) => queued,
        }
    }

    /// Send one message over the stream: length handshake, payload, then
    /// wait for the receiver's completion ACK.
    #[instrument(level = "debug", skip_all, fields(box_id = message.box_id, kind = %message.kind))]
    pub async fn tcp_send(&mut self, message: &Message) -> Result<()> {
        self.offer_message(message, false).await.map(|_| ())
    }

    /// Send `message`, or yield to the peer's message when `contended`.
    ///
    /// Returns the peer's size indicator when this side gave way; the
    /// message was then not sent.
    async fn offer_message(&mut self, message: &Message, contended: bool) -> Result<Option<u8>> {
        let envelope = message.encode()?;
        let frame = self.cipher.encrypt(&envelope)?;
        let amount =
            u32::try_from(frame.len()).map_err(|_| ProtocolError::OversizedPacket(frame.len()))?;
        let buffer_len = self.task.buffer_length;

        if let Some(theirs) = self.offer_amount(amount, contended).await? {
            return Ok(Some(theirs));
        }
        self.send_bytes(&frame, buffer_len).await?;
        self.receive_ack().await?;

        self.report.messages_sent += 1;
        self.report.bytes_sent += frame.len() as u64;
        self.metrics.message_sent(frame.len() as u64);
        trace!(bytes = frame.len(), "Message sent");
        Ok(None)
    }

    /// Receive one message from the stream and enqueue it into its box
    #[instrument(level = "debug", skip_all)]
    pub async fn tcp_receive(&mut self) -> Result<Message> {
        self.receive_message(None).await
    }

    async fn receive_message(&mut self, indicator: Option<u8>) -> Result<Message> {
        let amount = self.receive_amount_after(indicator).await? as usize;
        let buffer_len = self.task.buffer_length;
        let frame = self.receive_bytes(Some(amount), buffer_len).await?;
        if frame.len() < amount {
            return Err(ProtocolError::IncompleteTransmission {
                expected: amount,
                received: frame.len(),
            });
        }

        let envelope = self.cipher.decrypt(&frame)?;
        let message = Message::decode(&envelope)?;
        self.deliver(message.clone()).await?;
        self.send_ack().await?;

        self.report.messages_received += 1;
        self.report.bytes_received += frame.len() as u64;
        self.metrics.message_received(frame.len() as u64);
        trace!(bytes = frame.len(), box_id = message.box_id, "Message received");
        Ok(message)
    }

    /// Exchange messages until cancelled or the peer closes.
    ///
    /// Each pass sends one queued outbound message, if any, then polls the
    /// stream for an inbound one for at most the tolerance delay. When both
    /// peers start a send at once the side that opened the connection
    /// receives the other's message first, then sends its own on the next
    /// pass.
    #[instrument(level = "debug", skip_all)]
    pub async fn tcp_bidirectional(&mut self) -> Result<()> {
        let wait = self.task.tolerance_delay.max(Duration::from_millis(1));
        let mut held: Option<Message> = None;
        loop {
            if self.unit_cancel().is_cancelled() {
                return Err(ProtocolError::Cancelled);
            }

            if let Some(message) = held.take().or_else(|| self.try_next_outbound()) {
                if let Some(theirs) = self.offer_message(&message, true).await? {
                    self.receive_message(Some(theirs)).await?;
                    held = Some(message);
                    continue;
                }
            }

            match connected(&mut self.ctx)?.poll_readable(wait).await {
                Ok(true) => {
                    self.tcp_receive().await?;
                }
                Ok(false) => {}
                Err(ProtocolError::ConnectionClosed) => {
                    debug!("Peer closed bidirectional exchange");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Send one message as a single datagram, optionally waiting for the ACK
    /// datagram
    #[instrument(level = "debug", skip_all, fields(box_id = message.box_id, with_ack = with_ack))]
    pub async fn udp_send(&mut self, message: &Message, with_ack: bool) -> Result<()> {
        let frame = self.cipher.encrypt(&message.encode()?)?;
        let ctx = connected(&mut self.ctx)?;
        if frame.len() > ctx.buffer_size() {
            return Err(ProtocolError::OversizedPacket(frame.len()));
        }
        ctx.send_datagram(&frame).await?;
        if with_ack {
            self.receive_ack().await?;
        }

        self.report.messages_sent += 1;
        self.report.bytes_sent += frame.len() as u64;
        self.metrics.message_sent(frame.len() as u64);
        Ok(())
    }

    /// Consume the pending datagram (or wait for one) and enqueue its
    /// message, optionally answering with an ACK datagram.
    ///
    /// A zero-length datagram is a valid empty message: nothing is enqueued
    /// and `Ok(None)` is returned.
    #[instrument(level = "debug", skip_all, fields(with_ack = with_ack))]
    pub async fn udp_receive(&mut self, with_ack: bool) -> Result<Option<Message>> {
        let ctx = connected(&mut self.ctx)?;
        let datagram = match ctx.take_pending() {
            Some(datagram) => datagram,
            None => {
                let (max_len, timeout) = (ctx.buffer_size(), ctx.op_timeout());
                ctx.recv_datagram(max_len, timeout).await?
            }
        };

        if datagram.is_empty() {
            debug!("Zero-length datagram");
            if with_ack {
                self.send_ack().await?;
            }
            return Ok(None);
        }

        let envelope = self.cipher.decrypt(&datagram)?;
        let message = Message::decode(&envelope)?;
        self.deliver(message.clone()).await?;
        if with_ack {
            self.send_ack().await?;
        }

        self.report.messages_received += 1;
        self.report.bytes_received += datagram.len() as u64;
        self.metrics.message_received(datagram.len() as u64);
        Ok(Some(message))
    }
}
