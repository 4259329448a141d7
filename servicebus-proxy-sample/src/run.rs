//! Sequencing of a sample run

use std::{fmt, future::Future, io::Read, time::Duration};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::{
    client::QueueConnector,
    error::{ClientError, Error},
    message::Scientist,
    receive::{Consumer, ConsumerOptions, MessageHandler},
    send::send_all,
};

/// Where a run is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Nothing started yet
    Idle,
    /// The receive loop is running
    ReceiverStarted,
    /// The sample batch is being sent
    SenderDispatched,
    /// Waiting for a keypress or the timeout
    Waiting,
    /// The receive loop has stopped and released its client
    ReceiverClosed,
    /// The run is over
    Terminal,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How a bounded wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A key was pressed
    Keypress,
    /// The time limit elapsed first
    TimedOut,
}

/// Options of a run
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Upper bound of the wait between dispatching the batch and stopping the receiver
    pub wait: Duration,

    /// Upper bound on opening the sending and the receiving client
    pub open_timeout: Duration,

    /// Options of the receive loop
    pub consumer: ConsumerOptions,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            wait: Duration::from_secs(10),
            open_timeout: Duration::from_secs(30),
            consumer: ConsumerOptions::default(),
        }
    }
}

/// Waits for `keypress` for at most `limit`
pub async fn bounded_wait<K>(keypress: K, limit: Duration) -> WaitOutcome
where
    K: Future<Output = ()>,
{
    tokio::select! {
        _ = keypress => WaitOutcome::Keypress,
        _ = tokio::time::sleep(limit) => WaitOutcome::TimedOut,
    }
}

/// Resolves when a byte (or end of input) is read from standard input
///
/// The read happens on a detached thread, so a read that never returns does not keep the
/// process alive.
pub fn stdin_keypress() -> impl Future<Output = ()> + Send + 'static {
    let (tx, rx) = oneshot::channel();
    let spawned = std::thread::Builder::new()
        .name("keypress".to_string())
        .spawn(move || {
            let mut buf = [0u8; 1];
            let _ = std::io::stdin().read(&mut buf);
            let _ = tx.send(());
        });
    if let Err(error) = spawned {
        tracing::warn!(%error, "cannot watch standard input, waiting for the timeout only");
    }

    async move {
        if rx.await.is_err() {
            std::future::pending::<()>().await
        }
    }
}

/// Runs the receiver and the sender against one queue
#[derive(Debug)]
pub struct Coordinator<C> {
    connector: C,
    queue: String,
    options: RunOptions,
    state: RunState,
}

/// Awaits `open`, giving up after `limit`
///
/// Both a failure and a timeout end the run as [`Error::TransportConnection`].
pub async fn open_within<T, F>(open: F, limit: Duration) -> Result<T, Error>
where
    F: Future<Output = Result<T, ClientError>>,
{
    match tokio::time::timeout(limit, open).await {
        Ok(opened) => opened.map_err(Error::TransportConnection),
        Err(_) => Err(Error::TransportConnection(ClientError::OpenTimeout(limit))),
    }
}

impl<C: QueueConnector + Clone> Coordinator<C> {
    /// Creates a new coordinator
    pub fn new(connector: C, queue: impl Into<String>, options: RunOptions) -> Self {
        Self {
            connector,
            queue: queue.into(),
            options,
            state: RunState::Idle,
        }
    }

    /// Current state
    pub fn state(&self) -> RunState {
        self.state
    }

    fn transition(&mut self, next: RunState) {
        tracing::info!(from = %self.state, to = %next, "run state");
        self.state = next;
    }

    /// Starts the receiver, sends the sample batch, waits for `keypress` or the timeout and stops
    /// the receiver
    ///
    /// The run always ends in [`RunState::Terminal`]. A sender still busy when the receiver has
    /// been stopped is left to finish on its own.
    pub async fn run<H, K>(&mut self, handler: H, keypress: K) -> Result<(), Error>
    where
        H: MessageHandler,
        K: Future<Output = ()>,
    {
        let result = self.run_inner(handler, keypress).await;
        self.transition(RunState::Terminal);
        result
    }

    async fn run_inner<H, K>(&mut self, handler: H, keypress: K) -> Result<(), Error>
    where
        H: MessageHandler,
        K: Future<Output = ()>,
    {
        let open_timeout = self.options.open_timeout;
        let source = open_within(self.connector.open_source(&self.queue), open_timeout).await?;
        let shutdown = CancellationToken::new();
        let consumer = Consumer::new(
            self.connector.clone(),
            self.queue.clone(),
            source,
            handler,
            self.options.consumer.clone(),
        );
        let receiver = tokio::spawn(consumer.run(shutdown.clone()));
        self.transition(RunState::ReceiverStarted);

        let sink = match open_within(self.connector.open_sink(&self.queue), open_timeout).await {
            Ok(sink) => sink,
            Err(error) => {
                shutdown.cancel();
                receiver.await?;
                self.transition(RunState::ReceiverClosed);
                return Err(error);
            }
        };
        let records = Scientist::samples();
        let sender = tokio::spawn(async move { send_all(sink, &records).await });
        self.transition(RunState::SenderDispatched);

        self.transition(RunState::Waiting);
        let outcome = bounded_wait(keypress, self.options.wait).await;
        tracing::info!(?outcome, "wait finished");

        shutdown.cancel();
        receiver.await?;
        self.transition(RunState::ReceiverClosed);

        if sender.is_finished() {
            sender.await??;
        } else {
            tracing::warn!("sender has not finished yet, leaving it running");
        }
        Ok(())
    }
}
