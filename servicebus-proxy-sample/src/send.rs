//! Sending the sample batch

use futures_util::future::join_all;

use crate::{
    client::MessageSink,
    error::ClientError,
    message::{OutgoingMessage, Scientist, LABEL, TIME_TO_LIVE},
};

/// A message that could not be sent
#[derive(Debug)]
pub struct FailedSend {
    /// Id of the message
    pub message_id: String,

    /// Why it failed
    pub error: ClientError,
}

/// Some messages of a batch could not be sent
#[derive(Debug, thiserror::Error)]
#[error("{} of {attempted} messages could not be sent", .failures.len())]
pub struct SendFailure {
    /// Number of messages in the batch
    pub attempted: usize,

    /// One entry per failed message
    pub failures: Vec<FailedSend>,
}

/// Sends every record of `records` as a JSON message and closes `sink`
///
/// All messages are dispatched before any settlement is awaited. Every message is attempted even
/// if some fail, and the sink is closed in any case.
pub async fn send_all<S: MessageSink>(mut sink: S, records: &[Scientist]) -> Result<(), SendFailure> {
    let mut pending = Vec::with_capacity(records.len());
    let mut failures = Vec::new();

    for (i, record) in records.iter().enumerate() {
        let message_id = i.to_string();
        let dispatched = match OutgoingMessage::json(&message_id[..], LABEL, record, TIME_TO_LIVE) {
            Ok(message) => {
                tracing::info!(message_id = %message_id, "Message sending");
                sink.dispatch(message).await
            }
            Err(error) => Err(error),
        };

        match dispatched {
            Ok(ack) => pending.push(async move {
                match ack.await {
                    Ok(()) => {
                        tracing::info!(message_id = %message_id, "Message acknowledged");
                        Ok(())
                    }
                    Err(error) => Err(FailedSend { message_id, error }),
                }
            }),
            Err(error) => failures.push(FailedSend { message_id, error }),
        }
    }

    failures.extend(join_all(pending).await.into_iter().filter_map(Result::err));

    if let Err(error) = sink.close().await {
        tracing::warn!(%error, "closing sender failed");
    }

    if failures.is_empty() {
        Ok(())
    } else {
        for failure in &failures {
            tracing::error!(message_id = %failure.message_id, error = %failure.error, "Message failed");
        }
        Err(SendFailure {
            attempted: records.len(),
            failures,
        })
    }
}
