//! Event publishing/subscription abstraction (mechanics only).
//!
//! This module provides the **event bus pattern** used by the dispatch engine to
//! announce state changes without knowing who listens:
//!
//! - the job queue publishes every job transition (metrics, logging)
//! - the delivery tracker publishes status changes (UI push)
//! - the session registry publishes session status changes
//!
//! ## Delivery semantics
//!
//! - **Transport-agnostic**: in-memory channels, Redis pub/sub, ...
//! - **Best-effort fan-out**: a notification is a hint, the data store is the
//!   source of truth. Subscribers that fall behind or disconnect lose messages.
//! - **No ordering across publishers**: two workers publishing concurrently may
//!   interleave.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

/// A subscription to an event stream.
///
/// Each subscription gets a copy of every message published after it was
/// created (broadcast semantics).
///
/// ```ignore
/// let subscription = bus.subscribe();
///
/// loop {
///     match subscription.recv_timeout(Duration::from_secs(1)) {
///         Ok(event) => handle(event),
///         Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,  // check for shutdown
///         Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break, // bus dropped
///     }
/// }
/// ```
///
/// Subscriptions are meant for a single consumer thread. Async consumers should
/// drain them from `spawn_blocking` or poll with `try_recv`.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything currently buffered.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Domain-agnostic event bus (pub/sub abstraction).
///
/// `publish()` can fail (lock poisoning, network error). Publishers in the
/// dispatch engine log and continue: a lost notification never rolls back the
/// state change that produced it.
///
/// The trait requires `Send + Sync`; workers publish concurrently.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
