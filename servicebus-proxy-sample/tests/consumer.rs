//! Receive loop behavior against an in-memory queue

mod common;

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use common::{scientist_message, MemoryConnector, MemoryQueue};
use servicebus_proxy_sample::{
    message::{Disposition, ReceivedMessage},
    receive::{Consumer, ConsumerOptions, FaultPhase, HandlerFault, MessageHandler, ScientistHandler},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn consumer<H: MessageHandler>(
    queue: &MemoryQueue,
    handler: H,
    options: ConsumerOptions,
) -> Consumer<MemoryConnector, H> {
    Consumer::new(queue.connector(), "scientists", queue.source(), handler, options)
}

/// Waits (on the paused clock) until `done` holds
async fn eventually(done: impl Fn() -> bool) {
    for _ in 0..1000 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(start_paused = true)]
async fn non_matching_messages_are_completed_without_decoding() {
    let queue = MemoryQueue::new();
    queue.push(scientist_message("a", "Philosopher", "application/json", r#"{"name":"Kant"}"#));
    queue.push(scientist_message("b", "Scientist", "text/plain", "not even json"));
    queue.push(scientist_message(
        "c",
        "Scientist",
        "application/json",
        r#"{"name":"Newton","firstName":"Isaac"}"#,
    ));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();
    let consumer = consumer(
        &queue,
        ScientistHandler::with_listener(tx),
        ConsumerOptions::default(),
    );
    let handle = tokio::spawn(consumer.run(shutdown.clone()));

    let decoded = rx.recv().await.unwrap();
    assert_eq!(decoded.message_id.as_deref(), Some("c"));
    assert_eq!(decoded.name, "Newton");

    shutdown.cancel();
    handle.await.unwrap();

    assert!(rx.try_recv().is_err());
    assert_eq!(
        queue.settled(),
        vec![
            (Some("a".to_string()), Disposition::Complete),
            (Some("b".to_string()), Disposition::Complete),
            (Some("c".to_string()), Disposition::Complete),
        ]
    );
    assert_eq!(queue.closed_sources(), 1);
}

/// Records overlapping invocations
#[derive(Debug, Default)]
struct SlowHandler {
    in_flight: AtomicBool,
    overlaps: AtomicUsize,
    handled: AtomicUsize,
}

impl MessageHandler for SlowHandler {
    async fn on_message(&self, _message: &ReceivedMessage) -> Result<Disposition, HandlerFault> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
        self.in_flight.store(false, Ordering::SeqCst);
        self.handled.fetch_add(1, Ordering::SeqCst);
        Ok(Disposition::Complete)
    }

    fn notify_fault(&self, _fault: &HandlerFault, _phase: FaultPhase) {}
}

#[tokio::test(start_paused = true)]
async fn handler_is_never_reentered() {
    let queue = MemoryQueue::new();
    for i in 0..5 {
        queue.push(scientist_message(&i.to_string(), "Scientist", "application/json", "{}"));
    }

    let handler = Arc::new(SlowHandler::default());
    let shutdown = CancellationToken::new();
    let consumer = consumer(&queue, handler.clone(), ConsumerOptions::default());
    let handle = tokio::spawn(consumer.run(shutdown.clone()));

    eventually(|| handler.handled.load(Ordering::SeqCst) == 5).await;
    shutdown.cancel();
    handle.await.unwrap();

    assert_eq!(handler.overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(queue.settled().len(), 5);
}

/// Fails on one message id and records the reported faults
#[derive(Debug, Default)]
struct FaultyHandler {
    faults: Mutex<Vec<FaultPhase>>,
}

impl MessageHandler for FaultyHandler {
    async fn on_message(&self, message: &ReceivedMessage) -> Result<Disposition, HandlerFault> {
        if message.message_id.as_deref() == Some("bad") {
            return Err(std::str::from_utf8(&[0xff]).unwrap_err().into());
        }
        Ok(Disposition::Complete)
    }

    fn notify_fault(&self, _fault: &HandlerFault, phase: FaultPhase) {
        self.faults.lock().unwrap().push(phase);
    }
}

#[tokio::test(start_paused = true)]
async fn handler_fault_abandons_and_the_loop_continues() {
    let queue = MemoryQueue::new();
    queue.push(scientist_message("bad", "Scientist", "application/json", "{}"));
    queue.push(scientist_message("good", "Scientist", "application/json", "{}"));

    let handler = Arc::new(FaultyHandler::default());
    let shutdown = CancellationToken::new();
    let consumer = consumer(&queue, handler.clone(), ConsumerOptions::default());
    let handle = tokio::spawn(consumer.run(shutdown.clone()));

    eventually(|| queue.settled().len() == 2).await;
    shutdown.cancel();
    handle.await.unwrap();

    assert_eq!(
        queue.settled(),
        vec![
            (Some("bad".to_string()), Disposition::Abandon),
            (Some("good".to_string()), Disposition::Complete),
        ]
    );
    assert_eq!(*handler.faults.lock().unwrap(), vec![FaultPhase::UserCallback]);
}

#[tokio::test(start_paused = true)]
async fn receive_faults_are_reported_and_retried() {
    let queue = MemoryQueue::new();
    queue.fail_receives(2);
    queue.push(scientist_message("0", "Scientist", "application/json", "{}"));

    let handler = Arc::new(FaultyHandler::default());
    let shutdown = CancellationToken::new();
    let consumer = consumer(&queue, handler.clone(), ConsumerOptions::default());
    let start = tokio::time::Instant::now();
    let handle = tokio::spawn(consumer.run(shutdown.clone()));

    eventually(|| queue.settled().len() == 1).await;
    // Two failed receives, each followed by the retry delay
    assert!(start.elapsed() >= Duration::from_secs(2));

    shutdown.cancel();
    handle.await.unwrap();
    assert_eq!(
        *handler.faults.lock().unwrap(),
        vec![FaultPhase::Receive, FaultPhase::Receive]
    );
    // Transient faults keep the source
    assert_eq!(queue.opened_sources(), 1);
}

#[tokio::test(start_paused = true)]
async fn lost_source_is_reopened_through_the_connector() {
    let queue = MemoryQueue::new();
    let handler = Arc::new(FaultyHandler::default());
    let consumer = consumer(&queue, handler.clone(), ConsumerOptions::default());

    queue.disconnect();
    queue.push(scientist_message("0", "Scientist", "application/json", "{}"));

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(consumer.run(shutdown.clone()));

    eventually(|| queue.settled().len() == 1).await;
    shutdown.cancel();
    handle.await.unwrap();

    assert_eq!(queue.settled(), vec![(Some("0".to_string()), Disposition::Complete)]);
    assert_eq!(queue.opened_sources(), 2);
    // The lost source and its replacement
    assert_eq!(queue.closed_sources(), 2);
    assert_eq!(*handler.faults.lock().unwrap(), vec![FaultPhase::Receive]);
}

#[tokio::test(start_paused = true)]
async fn failed_reopen_is_reported_and_retried() {
    let queue = MemoryQueue::new();
    let handler = Arc::new(FaultyHandler::default());
    let consumer = consumer(&queue, handler.clone(), ConsumerOptions::default());

    queue.disconnect();
    queue.fail_source_opens(2);
    queue.push(scientist_message("0", "Scientist", "application/json", "{}"));

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(consumer.run(shutdown.clone()));

    eventually(|| queue.settled().len() == 1).await;
    shutdown.cancel();
    handle.await.unwrap();

    assert_eq!(
        *handler.faults.lock().unwrap(),
        vec![FaultPhase::Receive, FaultPhase::Reconnect, FaultPhase::Reconnect]
    );
    assert_eq!(queue.opened_sources(), 2);
}

/// Takes `duration` to handle every message
#[derive(Debug)]
struct LongHandler {
    duration: Duration,
}

impl MessageHandler for LongHandler {
    async fn on_message(&self, _message: &ReceivedMessage) -> Result<Disposition, HandlerFault> {
        tokio::time::sleep(self.duration).await;
        Ok(Disposition::Complete)
    }

    fn notify_fault(&self, _fault: &HandlerFault, _phase: FaultPhase) {}
}

#[tokio::test(start_paused = true)]
async fn lock_is_renewed_while_the_handler_runs() {
    let queue = MemoryQueue::new();
    queue.push(scientist_message("0", "Scientist", "application/json", "{}"));

    let shutdown = CancellationToken::new();
    let consumer = consumer(
        &queue,
        LongHandler {
            duration: Duration::from_secs(25),
        },
        ConsumerOptions::default(),
    );
    let handle = tokio::spawn(consumer.run(shutdown.clone()));

    eventually(|| queue.settled().len() == 1).await;
    shutdown.cancel();
    handle.await.unwrap();

    // Renewed after 10 s and 20 s
    assert_eq!(queue.renewals(), 2);
}

#[tokio::test(start_paused = true)]
async fn lock_renewal_stops_after_max_auto_renew() {
    let queue = MemoryQueue::new();
    queue.push(scientist_message("0", "Scientist", "application/json", "{}"));

    let shutdown = CancellationToken::new();
    let options = ConsumerOptions {
        max_auto_renew: Duration::from_secs(15),
        ..Default::default()
    };
    let consumer = consumer(
        &queue,
        LongHandler {
            duration: Duration::from_secs(40),
        },
        options,
    );
    let handle = tokio::spawn(consumer.run(shutdown.clone()));

    eventually(|| queue.settled().len() == 1).await;
    shutdown.cancel();
    handle.await.unwrap();

    assert_eq!(queue.renewals(), 1);
    assert_eq!(queue.settled(), vec![(Some("0".to_string()), Disposition::Complete)]);
}

#[tokio::test(start_paused = true)]
async fn renewal_in_flight_completes_before_settling() {
    let queue = MemoryQueue::new();
    queue.slow_renewals(Duration::from_secs(3));
    queue.push(scientist_message("0", "Scientist", "application/json", "{}"));

    let shutdown = CancellationToken::new();
    // The renewal starts at 10 s, the handler finishes at 11 s
    let consumer = consumer(
        &queue,
        LongHandler {
            duration: Duration::from_secs(11),
        },
        ConsumerOptions::default(),
    );
    let start = tokio::time::Instant::now();
    let handle = tokio::spawn(consumer.run(shutdown.clone()));

    eventually(|| queue.settled().len() == 1).await;
    assert_eq!(queue.renewals(), 1);
    assert!(start.elapsed() >= Duration::from_secs(13));

    shutdown.cancel();
    handle.await.unwrap();
}
