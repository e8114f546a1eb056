//! Local conduits between tasklets.
//!
//! Uses crossbeam-channel for bounded, single-consumer queues. Tasklets never
//! block on a conduit: a full conduit hands the element back to the sender, which
//! keeps it in its outbox and retries on a later call.

use crate::config::DEFAULT_CONDUIT_CAPACITY;
use crate::types::StreamElement;
use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};

/// Outcome of a non-blocking send.
#[derive(Debug, PartialEq)]
pub enum TrySend<T> {
    Sent,
    /// The conduit is full; the element is handed back unchanged.
    Full(StreamElement<T>),
}

/// Sender side of a conduit.
#[derive(Clone)]
pub struct ConduitSender<T> {
    sender: Sender<StreamElement<T>>,
}

impl<T> ConduitSender<T> {
    /// Send without blocking.
    ///
    /// Returns an error only if the receiving tasklet is gone.
    pub fn try_send(&self, element: StreamElement<T>) -> Result<TrySend<T>> {
        match self.sender.try_send(element) {
            Ok(()) => Ok(TrySend::Sent),
            Err(TrySendError::Full(element)) => Ok(TrySend::Full(element)),
            Err(TrySendError::Disconnected(_)) => {
                Err(anyhow!("Conduit closed: receiver dropped"))
            }
        }
    }

    /// Send, blocking while the conduit is full.
    ///
    /// Only for feeding conduits from outside the engine (tests, drivers).
    pub fn send(&self, element: StreamElement<T>) -> Result<()> {
        self.sender
            .send(element)
            .map_err(|_| anyhow!("Conduit closed: receiver dropped"))
    }

    pub fn is_full(&self) -> bool {
        self.sender.is_full()
    }
}

/// Receiver side of a conduit.
pub struct ConduitReceiver<T> {
    receiver: Receiver<StreamElement<T>>,
}

impl<T> ConduitReceiver<T> {
    /// Try to receive without blocking.
    ///
    /// Returns `Ok(None)` if no element is available.
    pub fn try_recv(&self) -> Result<Option<StreamElement<T>>> {
        match self.receiver.try_recv() {
            Ok(elem) => Ok(Some(elem)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(anyhow!("Conduit closed: sender dropped")),
        }
    }

    /// Receive, blocking until an element is available.
    pub fn recv(&self) -> Result<StreamElement<T>> {
        self.receiver
            .recv()
            .map_err(|_| anyhow!("Conduit closed: sender dropped"))
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

/// Create a bounded conduit pair.
pub fn conduit<T>(capacity: usize) -> (ConduitSender<T>, ConduitReceiver<T>) {
    let (sender, receiver) = bounded(capacity);
    (ConduitSender { sender }, ConduitReceiver { receiver })
}

/// Create a conduit with default capacity.
pub fn conduit_default<T>() -> (ConduitSender<T>, ConduitReceiver<T>) {
    conduit(DEFAULT_CONDUIT_CAPACITY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conduit_send_recv() {
        let (sender, receiver) = conduit::<i32>(10);
        assert_eq!(
            sender.try_send(StreamElement::record(42)).unwrap(),
            TrySend::Sent
        );
        assert_eq!(receiver.try_recv().unwrap(), Some(StreamElement::Record(42)));
        assert_eq!(receiver.try_recv().unwrap(), None);
    }

    #[test]
    fn test_conduit_full_hands_element_back() {
        let (sender, receiver) = conduit::<i32>(1);
        sender.try_send(StreamElement::record(1)).unwrap();
        assert!(sender.is_full());

        match sender.try_send(StreamElement::record(2)).unwrap() {
            TrySend::Full(elem) => assert_eq!(elem, StreamElement::Record(2)),
            TrySend::Sent => panic!("expected Full"),
        }
        assert_eq!(receiver.len(), 1);
    }

    #[test]
    fn test_conduit_disconnected_errors() {
        let (sender, receiver) = conduit::<i32>(1);
        drop(receiver);
        assert!(sender.try_send(StreamElement::End).is_err());

        let (sender, receiver) = conduit::<i32>(1);
        drop(sender);
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn test_conduit_preserves_order() {
        let (sender, receiver) = conduit::<i32>(10);
        sender.send(StreamElement::record(1)).unwrap();
        sender.send(StreamElement::barrier(0)).unwrap();
        sender.send(StreamElement::End).unwrap();

        assert_eq!(receiver.recv().unwrap(), StreamElement::Record(1));
        assert_eq!(receiver.recv().unwrap(), StreamElement::barrier(0));
        assert_eq!(receiver.recv().unwrap(), StreamElement::End);
        assert!(receiver.is_empty());
    }
}
