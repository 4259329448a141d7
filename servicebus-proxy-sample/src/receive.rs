//! Receive loop and the sample message handler

use std::{fmt, future::Future, ops::ControlFlow, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    client::{Incoming, MessageSource, QueueConnector},
    error::ClientError,
    message::{Disposition, ReceivedMessage, CONTENT_TYPE, LABEL},
};

/// Interval between lock renewals when the queue does not say when the lock expires
const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(10);

/// Lower bound on the interval between lock renewals
const MIN_RENEW_INTERVAL: Duration = Duration::from_secs(1);

/// Fault reported to [`MessageHandler::notify_fault`]
#[derive(Debug, thiserror::Error)]
pub enum HandlerFault {
    /// The message body is not UTF-8
    #[error("Message body is not UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    /// The message body is not a JSON object
    #[error("Message body is not a JSON object: {0}")]
    Json(#[from] serde_json::Error),

    /// The queue client failed
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Where in the receive loop a fault happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPhase {
    /// Waiting for a message
    Receive,
    /// Reopening the source after the link or connection was lost
    Reconnect,
    /// Renewing the lock of the message being handled
    RenewLock,
    /// Completing a message
    Complete,
    /// Abandoning a message
    Abandon,
    /// Dead-lettering a message
    DeadLetter,
    /// Deferring a message
    Defer,
    /// Inside [`MessageHandler::on_message`]
    UserCallback,
}

impl From<Disposition> for FaultPhase {
    fn from(disposition: Disposition) -> Self {
        match disposition {
            Disposition::Complete => FaultPhase::Complete,
            Disposition::Abandon => FaultPhase::Abandon,
            Disposition::DeadLetter => FaultPhase::DeadLetter,
            Disposition::Defer => FaultPhase::Defer,
        }
    }
}

impl fmt::Display for FaultPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            FaultPhase::Receive => "Receive",
            FaultPhase::Reconnect => "Reconnect",
            FaultPhase::RenewLock => "RenewLock",
            FaultPhase::Complete => "Complete",
            FaultPhase::Abandon => "Abandon",
            FaultPhase::DeadLetter => "DeadLetter",
            FaultPhase::Defer => "Defer",
            FaultPhase::UserCallback => "UserCallback",
        };
        f.write_str(phase)
    }
}

/// Handles received messages
pub trait MessageHandler: Send + Sync + 'static {
    /// Handles one message and decides how it is settled
    ///
    /// An error abandons the message.
    fn on_message(
        &self,
        message: &ReceivedMessage,
    ) -> impl Future<Output = Result<Disposition, HandlerFault>> + Send;

    /// Called for every fault of the receive loop. The loop keeps running afterwards.
    fn notify_fault(&self, fault: &HandlerFault, phase: FaultPhase);
}

impl<H: MessageHandler> MessageHandler for Arc<H> {
    fn on_message(
        &self,
        message: &ReceivedMessage,
    ) -> impl Future<Output = Result<Disposition, HandlerFault>> + Send {
        (**self).on_message(message)
    }

    fn notify_fault(&self, fault: &HandlerFault, phase: FaultPhase) {
        (**self).notify_fault(fault, phase)
    }
}

/// Options of the receive loop
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// How long the lock of a message is kept alive while it is being handled
    pub max_auto_renew: Duration,

    /// Pause after a failed receive or reconnect
    pub receive_retry_delay: Duration,

    /// Upper bound on closing a lost source and on opening its replacement
    pub reconnect_timeout: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            max_auto_renew: Duration::from_secs(60),
            receive_retry_delay: Duration::from_secs(1),
            reconnect_timeout: Duration::from_secs(30),
        }
    }
}

/// Receives and handles messages one at a time until cancelled
///
/// When the link or connection behind the source is lost, the source is closed and a new one is
/// opened through the connector.
pub struct Consumer<C: QueueConnector, H> {
    connector: C,
    queue: String,
    source: Option<C::Source>,
    handler: H,
    options: ConsumerOptions,
}

impl<C: QueueConnector, H> fmt::Debug for Consumer<C, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("queue", &self.queue)
            .field("connected", &self.source.is_some())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<C, H> Consumer<C, H>
where
    C: QueueConnector,
    H: MessageHandler,
{
    /// Creates a new consumer reading from `source`, an already opened source of `queue`
    pub fn new(
        connector: C,
        queue: impl Into<String>,
        source: C::Source,
        handler: H,
        options: ConsumerOptions,
    ) -> Self {
        Self {
            connector,
            queue: queue.into(),
            source: Some(source),
            handler,
            options,
        }
    }

    /// Runs the receive loop until `shutdown` is cancelled, then closes the source
    ///
    /// A message that is being handled when `shutdown` is cancelled is handled and settled
    /// before the loop stops.
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::debug!(queue = %self.queue, "receive loop started");
        loop {
            if self.source.is_none() {
                let reopened = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    reopened = reopen(
                        &self.connector,
                        &self.queue,
                        self.options.reconnect_timeout,
                    ) => reopened,
                };
                match reopened {
                    Ok(source) => {
                        tracing::info!(queue = %self.queue, "receiver reconnected");
                        self.source = Some(source);
                    }
                    Err(error) => {
                        self.handler
                            .notify_fault(&HandlerFault::Client(error), FaultPhase::Reconnect);
                        if pause(&shutdown, self.options.receive_retry_delay).await.is_break() {
                            break;
                        }
                        continue;
                    }
                }
            }
            let Some(source) = self.source.as_mut() else {
                continue;
            };

            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = source.receive() => received,
            };

            match received {
                Ok(Some(incoming)) => {
                    process(source, &self.handler, &self.options, incoming).await
                }
                Ok(None) => {
                    tracing::debug!("source has no more messages");
                    shutdown.cancelled().await;
                    break;
                }
                Err(error) => {
                    let disconnected = error.is_disconnected();
                    self.handler
                        .notify_fault(&HandlerFault::Client(error), FaultPhase::Receive);
                    if disconnected {
                        tracing::warn!(queue = %self.queue, "receiver disconnected");
                        self.close_source().await;
                    }
                    if pause(&shutdown, self.options.receive_retry_delay).await.is_break() {
                        break;
                    }
                }
            }
        }

        self.close_source().await;
        tracing::debug!("receive loop stopped");
    }

    async fn close_source(&mut self) {
        let Some(source) = self.source.take() else {
            return;
        };
        match tokio::time::timeout(self.options.reconnect_timeout, source.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => tracing::warn!(%error, "closing receiver failed"),
            Err(_) => tracing::warn!("closing receiver timed out"),
        }
    }
}

async fn reopen<C: QueueConnector>(
    connector: &C,
    queue: &str,
    timeout: Duration,
) -> Result<C::Source, ClientError> {
    tokio::time::timeout(timeout, connector.open_source(queue))
        .await
        .map_err(|_| ClientError::OpenTimeout(timeout))?
}

/// Sleeps for `delay` unless `shutdown` is cancelled first
async fn pause(shutdown: &CancellationToken, delay: Duration) -> ControlFlow<()> {
    tokio::select! {
        _ = shutdown.cancelled() => ControlFlow::Break(()),
        _ = tokio::time::sleep(delay) => ControlFlow::Continue(()),
    }
}

/// Handles one message while keeping its lock alive, then settles it
///
/// A renewal that has started is always awaited to the end, even when the handler finishes
/// first, so that its response is not left for the next request.
async fn process<S, H>(
    source: &mut S,
    handler: &H,
    options: &ConsumerOptions,
    incoming: Incoming<S::Lock>,
) where
    S: MessageSource,
    H: MessageHandler,
{
    let Incoming { message, lock } = incoming;
    let deadline = Instant::now() + options.max_auto_renew;
    let mut locked_until = message.locked_until;

    let outcome = {
        let handling = handler.on_message(&message);
        tokio::pin!(handling);
        loop {
            let now = Instant::now();
            if now >= deadline {
                break (&mut handling).await;
            }

            let next = (now + renewal_delay(locked_until, Utc::now())).min(deadline);
            tokio::select! {
                outcome = &mut handling => break outcome,
                _ = tokio::time::sleep_until(next) => {}
            }
            if Instant::now() >= deadline {
                continue;
            }

            let (renewed, finished) = {
                let renewal = source.renew_lock(&lock);
                tokio::pin!(renewal);
                let mut finished = None;
                let renewed = loop {
                    tokio::select! {
                        renewed = &mut renewal => break renewed,
                        outcome = &mut handling, if finished.is_none() => finished = Some(outcome),
                    }
                };
                (renewed, finished)
            };
            match renewed {
                Ok(expiry) => {
                    tracing::debug!(locked_until = ?expiry, "lock renewed");
                    locked_until = expiry;
                }
                Err(error) => {
                    handler.notify_fault(&HandlerFault::Client(error), FaultPhase::RenewLock)
                }
            }
            if let Some(outcome) = finished {
                break outcome;
            }
        }
    };

    let disposition = outcome.unwrap_or_else(|fault| {
        handler.notify_fault(&fault, FaultPhase::UserCallback);
        Disposition::Abandon
    });

    if let Err(error) = source.settle(lock, disposition).await {
        handler.notify_fault(&HandlerFault::Client(error), disposition.into());
    }
}

/// Renews halfway to the lock expiry
fn renewal_delay(locked_until: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Duration {
    match locked_until {
        Some(locked_until) => (locked_until - now)
            .to_std()
            .map(|remaining| (remaining / 2).max(MIN_RENEW_INTERVAL))
            .unwrap_or(MIN_RENEW_INTERVAL),
        None => DEFAULT_RENEW_INTERVAL,
    }
}

/// A decoded sample message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedScientist {
    /// Id of the message
    pub message_id: Option<String>,

    /// `name` field, empty if missing
    pub name: String,

    /// `firstName` field, empty if missing
    pub first_name: String,
}

/// Logs every `Scientist` message and completes all messages
///
/// Decoded messages are also forwarded to the listener, if there is one.
#[derive(Debug, Default)]
pub struct ScientistHandler {
    listener: Option<mpsc::UnboundedSender<ReceivedScientist>>,
}

impl ScientistHandler {
    /// Creates a handler that only logs
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a handler that also forwards decoded messages to `listener`
    pub fn with_listener(listener: mpsc::UnboundedSender<ReceivedScientist>) -> Self {
        Self {
            listener: Some(listener),
        }
    }
}

fn is_scientist(message: &ReceivedMessage) -> bool {
    message.label.as_deref() == Some(LABEL) && message.content_type.as_deref() == Some(CONTENT_TYPE)
}

fn field(fields: Option<&Map<String, Value>>, name: &str) -> String {
    match fields.and_then(|fields| fields.get(name)) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(value)) => value.clone(),
        Some(value) => value.to_string(),
    }
}

/// Decodes a JSON object body. `null` decodes to empty fields.
fn decode(message: &ReceivedMessage) -> Result<ReceivedScientist, HandlerFault> {
    let text = std::str::from_utf8(&message.body)?;
    let fields: Option<Map<String, Value>> = serde_json::from_str(text)?;
    Ok(ReceivedScientist {
        message_id: message.message_id.clone(),
        name: field(fields.as_ref(), "name"),
        first_name: field(fields.as_ref(), "firstName"),
    })
}

impl MessageHandler for ScientistHandler {
    async fn on_message(&self, message: &ReceivedMessage) -> Result<Disposition, HandlerFault> {
        if !is_scientist(message) {
            return Ok(Disposition::Complete);
        }

        let scientist = decode(message)?;
        tracing::info!(
            message_id = message.message_id.as_deref().unwrap_or_default(),
            sequence_number = ?message.sequence_number,
            enqueued_time = ?message.enqueued_time,
            expires_at = ?message.expires_at,
            content_type = CONTENT_TYPE,
            first_name = %scientist.first_name,
            name = %scientist.name,
            "Message received"
        );

        if let Some(listener) = &self.listener {
            // The listener going away does not stop the handler
            let _ = listener.send(scientist);
        }
        Ok(Disposition::Complete)
    }

    fn notify_fault(&self, fault: &HandlerFault, phase: FaultPhase) {
        tracing::warn!(%phase, %fault, "message handler fault");
    }
}
