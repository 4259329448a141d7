#![allow(dead_code)]

//! In-memory queue implementing the client traits, and a recording HTTP proxy

use std::{
    collections::HashSet,
    future::{ready, Ready},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use servicebus_proxy_sample::{
    client::{Incoming, MessageSink, MessageSource, QueueConnector},
    message::{Disposition, OutgoingMessage, ReceivedMessage},
    ClientError,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpListener,
    sync::mpsc,
};

#[derive(Debug)]
struct Inner {
    tx: mpsc::UnboundedSender<ReceivedMessage>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ReceivedMessage>>,
    sent: Mutex<Vec<OutgoingMessage>>,
    settled: Mutex<Vec<(Option<String>, Disposition)>>,
    rejected_ids: Mutex<HashSet<String>>,
    failing_receives: AtomicUsize,
    failing_opens: AtomicUsize,
    epoch: AtomicUsize,
    renewals: AtomicUsize,
    renewal_delay: Mutex<Duration>,
    opened_sources: AtomicUsize,
    closed_sinks: AtomicUsize,
    closed_sources: AtomicUsize,
}

/// A queue living in memory. Clones share the same queue.
#[derive(Debug, Clone)]
pub struct MemoryQueue {
    inner: Arc<Inner>,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                tx,
                rx: tokio::sync::Mutex::new(rx),
                sent: Mutex::new(Vec::new()),
                settled: Mutex::new(Vec::new()),
                rejected_ids: Mutex::new(HashSet::new()),
                failing_receives: AtomicUsize::new(0),
                failing_opens: AtomicUsize::new(0),
                epoch: AtomicUsize::new(0),
                renewals: AtomicUsize::new(0),
                renewal_delay: Mutex::new(Duration::ZERO),
                opened_sources: AtomicUsize::new(0),
                closed_sinks: AtomicUsize::new(0),
                closed_sources: AtomicUsize::new(0),
            }),
        }
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a message as if another client had sent it
    pub fn push(&self, message: ReceivedMessage) {
        self.inner.tx.send(message).unwrap();
    }

    /// Messages with this id are not accepted by the queue
    pub fn reject_id(&self, message_id: &str) {
        self.inner
            .rejected_ids
            .lock()
            .unwrap()
            .insert(message_id.to_string());
    }

    /// The next `count` receives fail
    pub fn fail_receives(&self, count: usize) {
        self.inner.failing_receives.store(count, Ordering::SeqCst);
    }

    /// The next `count` source opens through a connector fail
    pub fn fail_source_opens(&self, count: usize) {
        self.inner.failing_opens.store(count, Ordering::SeqCst);
    }

    /// Every source opened so far loses its link
    pub fn disconnect(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Lock renewals take `delay` to complete
    pub fn slow_renewals(&self, delay: Duration) {
        *self.inner.renewal_delay.lock().unwrap() = delay;
    }

    /// A connector opening clients on this queue
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            queue: self.clone(),
            ..Default::default()
        }
    }

    pub fn sent(&self) -> Vec<OutgoingMessage> {
        self.inner.sent.lock().unwrap().clone()
    }

    pub fn settled(&self) -> Vec<(Option<String>, Disposition)> {
        self.inner.settled.lock().unwrap().clone()
    }

    pub fn renewals(&self) -> usize {
        self.inner.renewals.load(Ordering::SeqCst)
    }

    pub fn opened_sources(&self) -> usize {
        self.inner.opened_sources.load(Ordering::SeqCst)
    }

    pub fn closed_sinks(&self) -> usize {
        self.inner.closed_sinks.load(Ordering::SeqCst)
    }

    pub fn closed_sources(&self) -> usize {
        self.inner.closed_sources.load(Ordering::SeqCst)
    }

    pub fn sink(&self) -> MemorySink {
        MemorySink {
            inner: self.inner.clone(),
        }
    }

    pub fn source(&self) -> MemorySource {
        self.inner.opened_sources.fetch_add(1, Ordering::SeqCst);
        MemorySource {
            inner: self.inner.clone(),
            epoch: self.inner.epoch.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug)]
pub struct MemorySink {
    inner: Arc<Inner>,
}

impl MessageSink for MemorySink {
    type Ack = Ready<Result<(), ClientError>>;

    async fn dispatch(&mut self, message: OutgoingMessage) -> Result<Self::Ack, ClientError> {
        self.inner.sent.lock().unwrap().push(message.clone());
        if self
            .inner
            .rejected_ids
            .lock()
            .unwrap()
            .contains(&message.message_id)
        {
            return Ok(ready(Err(ClientError::NotAccepted("Rejected".to_string()))));
        }

        let received = ReceivedMessage {
            message_id: Some(message.message_id),
            label: Some(message.label),
            content_type: Some(message.content_type),
            body: message.body,
            ..Default::default()
        };
        self.inner.tx.send(received).map_err(|_| ClientError::Closed)?;
        Ok(ready(Ok(())))
    }

    async fn close(self) -> Result<(), ClientError> {
        self.inner.closed_sinks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug)]
pub struct MemoryLock {
    pub message_id: Option<String>,
}

#[derive(Debug)]
pub struct MemorySource {
    inner: Arc<Inner>,
    epoch: usize,
}

impl MessageSource for MemorySource {
    type Lock = MemoryLock;

    async fn receive(&mut self) -> Result<Option<Incoming<MemoryLock>>, ClientError> {
        if self.inner.epoch.load(Ordering::SeqCst) != self.epoch {
            return Err(ClientError::Closed);
        }
        let failing = self
            .inner
            .failing_receives
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(ClientError::NotAccepted("receive failed".to_string()));
        }

        let mut rx = self.inner.rx.lock().await;
        Ok(rx.recv().await.map(|message| Incoming {
            lock: MemoryLock {
                message_id: message.message_id.clone(),
            },
            message,
        }))
    }

    async fn settle(&mut self, lock: MemoryLock, disposition: Disposition) -> Result<(), ClientError> {
        self.inner
            .settled
            .lock()
            .unwrap()
            .push((lock.message_id, disposition));
        Ok(())
    }

    async fn renew_lock(&mut self, _lock: &MemoryLock) -> Result<Option<DateTime<Utc>>, ClientError> {
        let delay = *self.inner.renewal_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.inner.renewals.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }

    async fn close(self) -> Result<(), ClientError> {
        self.inner.closed_sources.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    pub queue: MemoryQueue,
    pub fail_sink: bool,
    pub fail_source: bool,
    /// Opening a sink never completes
    pub hang_sink: bool,
    /// Opening a source never completes
    pub hang_source: bool,
}

impl QueueConnector for MemoryConnector {
    type Sink = MemorySink;
    type Source = MemorySource;

    async fn open_sink(&self, _queue: &str) -> Result<MemorySink, ClientError> {
        if self.hang_sink {
            std::future::pending::<()>().await;
        }
        if self.fail_sink {
            return Err(ClientError::Closed);
        }
        Ok(self.queue.sink())
    }

    async fn open_source(&self, _queue: &str) -> Result<MemorySource, ClientError> {
        if self.hang_source {
            std::future::pending::<()>().await;
        }
        let failing = self
            .queue
            .inner
            .failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if self.fail_source || failing.is_ok() {
            return Err(ClientError::Closed);
        }
        Ok(self.queue.source())
    }
}

/// A message as the sample would send it
pub fn scientist_message(message_id: &str, label: &str, content_type: &str, body: &str) -> ReceivedMessage {
    ReceivedMessage {
        message_id: Some(message_id.to_string()),
        label: Some(label.to_string()),
        content_type: Some(content_type.to_string()),
        body: body.as_bytes().to_vec(),
        ..Default::default()
    }
}

/// Accepts one connection, answers its request head with `502 Bad Gateway` and returns the
/// request line
pub async fn spawn_refusing_proxy() -> (u16, tokio::task::JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut stream = BufReader::new(stream);
        let mut request_line = String::new();
        stream.read_line(&mut request_line).await.unwrap();
        loop {
            let mut line = String::new();
            stream.read_line(&mut line).await.unwrap();
            if line == "\r\n" || line.is_empty() {
                break;
            }
        }
        stream
            .get_mut()
            .write_all(b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
        request_line.trim_end().to_string()
    });
    (port, handle)
}
