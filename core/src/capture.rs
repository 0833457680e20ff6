use crate::event::RawEvent;
use anyhow::Result;
use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::{Mutex, PoisonError};

/// Bounded lock-free queue between event producers and a trace's ingestion task
pub struct EventCapture {
    sender: Sender<RawEvent>,
    receiver: Receiver<RawEvent>,
    capacity: usize,
    producers: Mutex<()>,
}

impl EventCapture {
    pub fn new(buffer_size: usize) -> Self {
        let capacity = buffer_size.max(1);
        let (sender, receiver) = bounded(capacity);
        Self {
            sender,
            receiver,
            capacity,
            producers: Mutex::new(()),
        }
    }

    /// Queue a whole batch, or nothing when it does not fit.
    ///
    /// The consumer only ever frees slots, so a batch that fits when checked
    /// still fits when sent.
    pub fn capture_batch(&self, events: Vec<RawEvent>) -> Result<usize> {
        let _producer = self.producers.lock().unwrap_or_else(PoisonError::into_inner);
        let free = self.capacity.saturating_sub(self.receiver.len());
        if events.len() > free {
            anyhow::bail!(
                "Event queue is full: {} event(s) submitted, {} slot(s) free",
                events.len(),
                free
            );
        }

        let count = events.len();
        for event in events {
            self.sender.try_send(event).map_err(|e| match e {
                TrySendError::Full(_) => anyhow::anyhow!("Event queue is full"),
                TrySendError::Disconnected(_) => anyhow::anyhow!("Event queue is closed"),
            })?;
        }
        Ok(count)
    }

    /// Get the receiver for processing events
    pub fn get_receiver(&self) -> Receiver<RawEvent> {
        self.receiver.clone()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}
