//! Process-local broadcast of ledger notifications.
//!
//! Every subscriber owns an unbounded std channel. `publish` clones the message into
//! each live channel and forgets channels whose receiver has been dropped. Nothing is
//! retained for subscribers that join later.

use std::sync::mpsc::{self, Sender};
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;

use crate::bus::{EventBus, Subscription};

#[derive(Debug, Error)]
pub enum InMemoryBusError {
    /// A publisher panicked while fanning out.
    #[error("event bus fan-out lock poisoned")]
    Poisoned,
}

#[derive(Debug)]
struct Fanout<M> {
    senders: Vec<Sender<M>>,
    delivered: u64,
}

/// Broadcast bus for a single process.
///
/// Publishing never blocks on a slow subscriber; its channel just grows.
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    fanout: Mutex<Fanout<M>>,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live subscribers as of the last publish.
    pub fn subscriber_count(&self) -> usize {
        self.fanout().map(|f| f.senders.len()).unwrap_or(0)
    }

    /// Copies handed to subscribers since the bus was created.
    pub fn delivered_count(&self) -> u64 {
        self.fanout().map(|f| f.delivered).unwrap_or(0)
    }

    fn fanout(&self) -> Result<MutexGuard<'_, Fanout<M>>, InMemoryBusError> {
        self.fanout.lock().map_err(|_| InMemoryBusError::Poisoned)
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self {
            fanout: Mutex::new(Fanout {
                senders: Vec::new(),
                delivered: 0,
            }),
        }
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = InMemoryBusError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        let mut fanout = self.fanout()?;
        fanout.senders.retain(|tx| tx.send(message.clone()).is_ok());
        let live = fanout.senders.len() as u64;
        fanout.delivered += live;
        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::channel();
        // A poisoned fan-out list is still a valid list.
        self.fanout
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .senders
            .push(tx);
        Subscription::new(rx)
    }
}
