//! Messages exchanged through the queue

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ClientError;

/// Label of the sample messages
pub const LABEL: &str = "Scientist";

/// Content type of the sample messages
pub const CONTENT_TYPE: &str = "application/json";

/// Time-to-live of the sample messages
pub const TIME_TO_LIVE: Duration = Duration::from_secs(2 * 60);

/// Payload of the sample messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scientist {
    /// Family name
    pub name: String,

    /// Given name
    #[serde(rename = "firstName")]
    pub first_name: String,
}

impl Scientist {
    /// Creates a new record
    pub fn new(name: impl Into<String>, first_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            first_name: first_name.into(),
        }
    }

    /// The batch sent by the sample
    pub fn samples() -> Vec<Scientist> {
        [
            ("Einstein", "Albert"),
            ("Heisenberg", "Werner"),
            ("Curie", "Marie"),
            ("Hawking", "Steven"),
            ("Newton", "Isaac"),
            ("Bohr", "Niels"),
            ("Faraday", "Michael"),
            ("Galilei", "Galileo"),
            ("Kepler", "Johannes"),
            ("Kopernikus", "Nikolaus"),
        ]
        .into_iter()
        .map(|(name, first_name)| Scientist::new(name, first_name))
        .collect()
    }
}

/// A message to be sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Unique id
    pub message_id: String,

    /// Application-defined label
    pub label: String,

    /// MIME type of the body
    pub content_type: String,

    /// Duration after which the queue drops the message if it is still undelivered
    pub time_to_live: Duration,

    /// Body
    pub body: Vec<u8>,
}

impl OutgoingMessage {
    /// Encodes `value` as a JSON message
    pub fn json<T: Serialize>(
        message_id: impl Into<String>,
        label: impl Into<String>,
        value: &T,
        time_to_live: Duration,
    ) -> Result<Self, ClientError> {
        Ok(Self {
            message_id: message_id.into(),
            label: label.into(),
            content_type: CONTENT_TYPE.to_string(),
            time_to_live,
            body: serde_json::to_vec(value)?,
        })
    }
}

/// A message handed out by a queue source
///
/// Broker metadata is only present when the queue supplies it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Unique id
    pub message_id: Option<String>,

    /// Application-defined label
    pub label: Option<String>,

    /// MIME type of the body
    pub content_type: Option<String>,

    /// Body
    pub body: Vec<u8>,

    /// Number assigned by the queue when the message was accepted
    pub sequence_number: Option<i64>,

    /// When the message was accepted by the queue
    pub enqueued_time: Option<DateTime<Utc>>,

    /// When the message expires
    pub expires_at: Option<DateTime<Utc>>,

    /// Until when this receiver holds the lock on the message
    pub locked_until: Option<DateTime<Utc>>,
}

/// How a handled message is settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Remove the message from the queue
    Complete,

    /// Release the lock and make the message available again
    Abandon,

    /// Move the message to the dead-letter queue
    DeadLetter,

    /// Leave the message locked until the lock expires
    Defer,
}
