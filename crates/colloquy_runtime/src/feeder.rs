use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Single-slot rendezvous between the session (producer) and one run (consumer).
/// At most one pull is outstanding and at most one turn can wait for the next pull.
#[derive(Debug, Default)]
struct Slot {
    waiter: Option<oneshot::Sender<String>>,
    parked: Option<String>,
    closed: bool,
}

/// How an offered turn reached the run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// A pull was outstanding and received the turn directly.
    Handed,
    /// The run was busy; the turn is yielded on its next pull.
    Parked,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FeedError {
    #[error("another turn is already queued for the active run")]
    Occupied(String),
    #[error("turn feeder is closed")]
    Closed(String),
}

/// Session-side handle.
#[derive(Clone, Debug)]
pub struct TurnFeeder {
    slot: Arc<Mutex<Slot>>,
}

/// Run-side pull sequence handed to the engine.
#[derive(Debug)]
pub struct TurnSource {
    first: Option<String>,
    slot: Arc<Mutex<Slot>>,
    cancel: CancellationToken,
}

/// Create the feeder pair for a new run. `first_turn` is yielded without waiting;
/// cancelling `cancel` ends the sequence at the next pull.
pub fn turn_channel(first_turn: String, cancel: CancellationToken) -> (TurnFeeder, TurnSource) {
    let slot = Arc::new(Mutex::new(Slot::default()));
    (
        TurnFeeder {
            slot: Arc::clone(&slot),
        },
        TurnSource {
            first: Some(first_turn),
            slot,
            cancel,
        },
    )
}

fn lock_slot(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    match slot.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl TurnFeeder {
    /// Deliver one turn to the run.
    /// Allocation: none. Complexity: O(1).
    pub fn offer(&self, turn: String) -> Result<Delivery, FeedError> {
        let mut slot = lock_slot(&self.slot);
        if slot.closed {
            return Err(FeedError::Closed(turn));
        }

        let turn = match slot.waiter.take() {
            Some(waiter) => match waiter.send(turn) {
                Ok(()) => return Ok(Delivery::Handed),
                // The pull was abandoned; keep the turn for the next one.
                Err(turn) => turn,
            },
            None => turn,
        };

        if slot.parked.is_some() {
            return Err(FeedError::Occupied(turn));
        }
        slot.parked = Some(turn);
        Ok(Delivery::Parked)
    }

    /// True while the run is suspended waiting for the next human turn.
    pub fn is_awaiting(&self) -> bool {
        lock_slot(&self.slot)
            .waiter
            .as_ref()
            .is_some_and(|waiter| !waiter.is_closed())
    }

    /// End the sequence: an outstanding pull resolves to end-of-sequence and later pulls
    /// return `None`. Returns a parked turn that the run never consumed.
    pub fn close(&self) -> Option<String> {
        let mut slot = lock_slot(&self.slot);
        slot.closed = true;
        drop(slot.waiter.take());
        slot.parked.take()
    }
}

impl TurnSource {
    /// Pull the next turn, suspending until one is offered, the feeder closes,
    /// or the run scope is cancelled.
    pub async fn next_turn(&mut self) -> Option<String> {
        if let Some(first) = self.first.take() {
            return Some(first);
        }

        let rx = {
            let mut slot = lock_slot(&self.slot);
            if slot.closed {
                return None;
            }
            if let Some(turn) = slot.parked.take() {
                return Some(turn);
            }
            let (tx, rx) = oneshot::channel();
            slot.waiter = Some(tx);
            rx
        };

        tokio::select! {
            biased;
            turn = rx => turn.ok(),
            _ = self.cancel.cancelled() => None,
        }
    }
}
