//! Queue client abstractions
//!
//! The orchestration code only talks to a queue through these traits. [`crate::amqp`] implements
//! them on top of an AMQP 1.0 connection; the tests implement them with an in-memory queue.

use std::future::Future;

use chrono::{DateTime, Utc};

use crate::{
    error::ClientError,
    message::{Disposition, OutgoingMessage, ReceivedMessage},
};

/// Sending side of a queue
pub trait MessageSink: Send + 'static {
    /// Resolves once the queue has settled a dispatched message
    type Ack: Future<Output = Result<(), ClientError>> + Send + 'static;

    /// Hands `message` to the queue without waiting for it to be settled
    fn dispatch(
        &mut self,
        message: OutgoingMessage,
    ) -> impl Future<Output = Result<Self::Ack, ClientError>> + Send;

    /// Releases the sink and its connection
    fn close(self) -> impl Future<Output = Result<(), ClientError>> + Send;
}

/// A message together with the lock that settles it
#[derive(Debug)]
pub struct Incoming<L> {
    /// The message
    pub message: ReceivedMessage,

    /// Handle used to settle the message or renew its lock
    pub lock: L,
}

/// Receiving side of a queue, in peek-lock mode
pub trait MessageSource: Send + 'static {
    /// Handle identifying a locked message
    type Lock: Send + Sync;

    /// Waits for the next message. `None` means the source will not yield any more messages.
    fn receive(
        &mut self,
    ) -> impl Future<Output = Result<Option<Incoming<Self::Lock>>, ClientError>> + Send;

    /// Settles a locked message
    fn settle(
        &mut self,
        lock: Self::Lock,
        disposition: Disposition,
    ) -> impl Future<Output = Result<(), ClientError>> + Send;

    /// Extends the lock on a message. Returns the new expiry if the queue reports one.
    fn renew_lock(
        &mut self,
        lock: &Self::Lock,
    ) -> impl Future<Output = Result<Option<DateTime<Utc>>, ClientError>> + Send;

    /// Releases the source and its connection
    fn close(self) -> impl Future<Output = Result<(), ClientError>> + Send;
}

/// Opens sinks and sources for a queue
pub trait QueueConnector: Send + Sync + 'static {
    /// Sink type
    type Sink: MessageSink;

    /// Source type
    type Source: MessageSource;

    /// Opens a sink sending to `queue`
    fn open_sink(&self, queue: &str) -> impl Future<Output = Result<Self::Sink, ClientError>> + Send;

    /// Opens a source receiving from `queue`
    fn open_source(
        &self,
        queue: &str,
    ) -> impl Future<Output = Result<Self::Source, ClientError>> + Send;
}
