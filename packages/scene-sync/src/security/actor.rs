//! Minimal mailbox actors.
//!
//! An actor owns its state outright and sees one message at a time. Senders
//! hold a cloneable [`Address`]; the owner of the [`ActorCell`] drains the
//! mailbox cooperatively with [`ActorCell::run_pending`], so message handling
//! is serialized without locks.
//!
//! A handler that panics loses only the message it was handling; the cell
//! logs the panic and moves on to the next one.

use std::panic::{self, AssertUnwindSafe};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{error, trace};

use crate::error::panic_message;

/// Upper bound on messages handled per drain, so a chatty sender cannot
/// starve the caller.
const MAILBOX_BUDGET: usize = 256;

pub trait Actor: Send + 'static {
    type Message: Send + 'static;
    type Output;

    fn name(&self) -> &'static str;

    fn handle(&mut self, message: Self::Message, now: DateTime<Utc>) -> Vec<Self::Output>;
}

/// Sending half of a mailbox.
pub struct Address<M> {
    sender: mpsc::UnboundedSender<M>,
}

impl<M> Clone for Address<M> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<M: Send + 'static> Address<M> {
    /// Returns false once the actor is gone.
    pub fn tell(&self, message: M) -> bool {
        self.sender.send(message).is_ok()
    }
}

impl<M> std::fmt::Debug for Address<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Address")
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

pub struct ActorCell<A: Actor> {
    actor: A,
    mailbox: mpsc::UnboundedReceiver<A::Message>,
    address: Address<A::Message>,
    panics: usize,
}

impl<A: Actor> ActorCell<A> {
    pub fn new(actor: A) -> Self {
        let (sender, mailbox) = mpsc::unbounded_channel();
        Self {
            actor,
            mailbox,
            address: Address { sender },
            panics: 0,
        }
    }

    pub fn address(&self) -> Address<A::Message> {
        self.address.clone()
    }

    /// Read-only view of the actor's state.
    pub fn actor(&self) -> &A {
        &self.actor
    }

    /// Messages whose handler panicked.
    pub fn panics(&self) -> usize {
        self.panics
    }

    /// Handle queued messages in arrival order.
    ///
    /// Returns how many were handled along with everything they produced.
    /// A panicking message counts as handled and produces nothing.
    pub fn run_pending(&mut self, now: DateTime<Utc>) -> (usize, Vec<A::Output>) {
        let mut outputs = Vec::new();
        let mut handled = 0;
        while handled < MAILBOX_BUDGET {
            let Ok(message) = self.mailbox.try_recv() else {
                break;
            };
            let actor = &mut self.actor;
            match panic::catch_unwind(AssertUnwindSafe(|| actor.handle(message, now))) {
                Ok(produced) => outputs.extend(produced),
                Err(payload) => {
                    self.panics += 1;
                    error!(
                        actor = self.actor.name(),
                        panic = %panic_message(&*payload),
                        "actor handler panicked, message dropped"
                    );
                }
            }
            handled += 1;
        }
        if handled > 0 {
            trace!(actor = self.actor.name(), handled, "mailbox drained");
        }
        (handled, outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        total: u32,
    }

    impl Actor for Counter {
        type Message = u32;
        type Output = u32;

        fn name(&self) -> &'static str {
            "counter"
        }

        fn handle(&mut self, message: u32, _now: DateTime<Utc>) -> Vec<u32> {
            assert!(message != 0, "zero is not a count");
            self.total += message;
            vec![self.total]
        }
    }

    #[test]
    fn messages_are_handled_in_order() {
        let mut cell = ActorCell::new(Counter { total: 0 });
        let address = cell.address();
        address.tell(1);
        address.tell(2);
        address.clone().tell(3);

        let (handled, outputs) = cell.run_pending(Utc::now());
        assert_eq!(handled, 3);
        assert_eq!(outputs, vec![1, 3, 6]);
        assert_eq!(cell.actor().total, 6);

        let (handled, outputs) = cell.run_pending(Utc::now());
        assert_eq!(handled, 0);
        assert!(outputs.is_empty());
    }

    #[test]
    fn panicking_message_does_not_stop_the_mailbox() {
        let mut cell = ActorCell::new(Counter { total: 0 });
        let address = cell.address();
        address.tell(2);
        address.tell(0);
        address.tell(5);

        let (handled, outputs) = cell.run_pending(Utc::now());
        assert_eq!(handled, 3);
        assert_eq!(outputs, vec![2, 7]);
        assert_eq!(cell.panics(), 1);

        address.tell(1);
        let (_, outputs) = cell.run_pending(Utc::now());
        assert_eq!(outputs, vec![8]);
    }

    #[test]
    fn tell_fails_after_cell_is_dropped() {
        let cell = ActorCell::new(Counter { total: 0 });
        let address = cell.address();
        drop(cell);
        assert!(!address.tell(1));
    }
}
