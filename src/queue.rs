//! # Message Boxes
//!
//! Bounded, thread-safe queues of [`Message`]s, one per logical channel.
//!
//! The protocol engine dequeues outbound messages from a box and enqueues the
//! messages it receives into one. Boxes are shared between the host and every
//! engine unit through [`MessageBoxes`], which is cheap to clone.
//!
//! Enqueue never blocks past its deadline: a full box is backpressure and
//! surfaces as [`ProtocolError::QueueFull`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::core::envelope::Message;
use crate::error::{ProtocolError, Result};

/// A bounded FIFO of messages
#[derive(Debug)]
pub struct MessageBox {
    id: u16,
    capacity: usize,
    items: Mutex<VecDeque<Message>>,
    available: Notify,
    space: Notify,
}

impl MessageBox {
    /// Create an empty box holding at most `capacity` messages
    pub fn new(id: u16, capacity: usize) -> Self {
        Self {
            id,
            capacity: capacity.max(1),
            items: Mutex::new(VecDeque::new()),
            available: Notify::new(),
            space: Notify::new(),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // a panic while holding the lock cannot leave the deque half-modified
    fn lock(&self) -> MutexGuard<'_, VecDeque<Message>> {
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue without waiting; fails with `QueueFull` if the box is full
    pub fn try_enqueue(&self, message: Message) -> Result<()> {
        {
            let mut items = self.lock();
            if items.len() >= self.capacity {
                return Err(ProtocolError::QueueFull(self.id));
            }
            items.push_back(message);
        }
        self.available.notify_one();
        Ok(())
    }

    /// Enqueue, waiting up to `timeout` for space
    pub async fn enqueue(&self, message: Message, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut items = self.lock();
                if items.len() < self.capacity {
                    items.push_back(message);
                    drop(items);
                    self.available.notify_one();
                    return Ok(());
                }
            }
            if tokio::time::timeout_at(deadline, self.space.notified())
                .await
                .is_err()
            {
                return Err(ProtocolError::QueueFull(self.id));
            }
        }
    }

    /// Dequeue without waiting
    pub fn try_dequeue(&self) -> Option<Message> {
        let message = self.lock().pop_front();
        if message.is_some() {
            self.space.notify_one();
        }
        message
    }

    /// Copy of the next message without removing it
    pub fn peek(&self) -> Option<Message> {
        self.lock().front().cloned()
    }

    /// Dequeue, waiting up to `timeout` for a message
    pub async fn dequeue(&self, timeout: Duration) -> Result<Message> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(message) = self.try_dequeue() {
                return Ok(message);
            }
            if tokio::time::timeout_at(deadline, self.available.notified())
                .await
                .is_err()
            {
                return Err(ProtocolError::NoMessage(self.id));
            }
        }
    }
}

/// The set of message boxes a task works with
#[derive(Debug, Clone, Default)]
pub struct MessageBoxes {
    boxes: Vec<Arc<MessageBox>>,
}

impl MessageBoxes {
    /// `count` boxes with ids `0..count`
    pub fn new(count: u16, capacity: usize) -> Self {
        Self {
            boxes: (0..count)
                .map(|id| Arc::new(MessageBox::new(id, capacity)))
                .collect(),
        }
    }

    /// A single box with id 0
    pub fn single(capacity: usize) -> Self {
        Self::new(1, capacity)
    }

    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    /// Box by position, in creation order
    pub fn at(&self, index: usize) -> Option<&Arc<MessageBox>> {
        self.boxes.get(index)
    }

    /// Box by id
    pub fn get(&self, id: u16) -> Option<&Arc<MessageBox>> {
        self.boxes.iter().find(|b| b.id() == id)
    }

    /// Box by id, failing with `UnknownMessageBox`
    pub fn require(&self, id: u16) -> Result<&Arc<MessageBox>> {
        self.get(id).ok_or(ProtocolError::UnknownMessageBox(id))
    }

    /// Lowest-id box that currently holds a message
    pub fn first_non_empty(&self) -> Option<&Arc<MessageBox>> {
        self.boxes
            .iter()
            .filter(|b| !b.is_empty())
            .min_by_key(|b| b.id())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<MessageBox>> {
        self.boxes.iter()
    }
}
