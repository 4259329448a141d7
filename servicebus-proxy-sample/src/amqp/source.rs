use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fe2o3_amqp::{
    connection::ConnectionHandle,
    link::receiver::CreditMode,
    session::SessionHandle,
    types::{
        definitions,
        messaging::{annotations::OwnedKey, Body, Message, MessageId, Modified},
        primitives::Value,
    },
    Delivery, Receiver, Session,
};

use super::management::ManagementLink;
use crate::{
    client::{Incoming, MessageSource},
    error::ClientError,
    message::{Disposition, ReceivedMessage},
};

const SEQUENCE_NUMBER: &str = "x-opt-sequence-number";
const ENQUEUED_TIME: &str = "x-opt-enqueued-time";
const LOCKED_UNTIL: &str = "x-opt-locked-until";
const LOCK_TOKEN: &str = "x-opt-lock-token";

/// Receives from a queue in peek-lock mode, one message at a time
#[derive(Debug)]
pub struct AmqpSource {
    queue: String,
    link_name: String,
    connection: ConnectionHandle<()>,
    session: SessionHandle<()>,
    receiver: Receiver,
    management: Option<ManagementLink>,
}

/// Lock on a delivery received by an [`AmqpSource`]
#[derive(Debug)]
pub struct AmqpLock {
    delivery: Delivery<Body<Value>>,
    token: Option<uuid::Uuid>,
}

impl AmqpSource {
    /// Attaches a peek-lock receiving link to `queue` on an open connection
    pub async fn attach(
        mut connection: ConnectionHandle<()>,
        queue: &str,
    ) -> Result<Self, ClientError> {
        let mut session = Session::begin(&mut connection).await?;
        let link_name = format!("{queue}-receiver-{}", uuid::Uuid::new_v4());
        let receiver = Receiver::builder()
            .name(link_name.clone())
            .source(queue)
            .credit_mode(CreditMode::Auto(1))
            .attach(&mut session)
            .await?;
        Ok(Self {
            queue: queue.to_string(),
            link_name,
            connection,
            session,
            receiver,
            management: None,
        })
    }
}

impl MessageSource for AmqpSource {
    type Lock = AmqpLock;

    async fn receive(&mut self) -> Result<Option<Incoming<AmqpLock>>, ClientError> {
        let delivery = self.receiver.recv::<Body<Value>>().await?;
        let message = received_message(delivery.message());
        let token = annotated_lock_token(delivery.message())
            .or_else(|| lock_token(delivery.delivery_tag()));
        Ok(Some(Incoming {
            message,
            lock: AmqpLock { delivery, token },
        }))
    }

    async fn settle(&mut self, lock: AmqpLock, disposition: Disposition) -> Result<(), ClientError> {
        match disposition {
            Disposition::Complete => self.receiver.accept(&lock.delivery).await?,
            Disposition::Abandon => {
                let modified = Modified {
                    delivery_failed: Some(true),
                    undeliverable_here: None,
                    message_annotations: None,
                };
                self.receiver.modify(&lock.delivery, modified).await?
            }
            Disposition::DeadLetter => {
                self.receiver
                    .reject(&lock.delivery, None::<definitions::Error>)
                    .await?
            }
            Disposition::Defer => {
                tracing::debug!(lock_token = ?lock.token, "leaving message locked");
            }
        }
        Ok(())
    }

    async fn renew_lock(&mut self, lock: &AmqpLock) -> Result<Option<DateTime<Utc>>, ClientError> {
        let Some(token) = lock.token else {
            tracing::debug!("delivery carries no lock token, not renewing");
            return Ok(None);
        };
        if self.management.is_none() {
            let link = ManagementLink::attach(&mut self.session, &self.queue, &self.link_name).await?;
            self.management = Some(link);
        }
        let Some(management) = self.management.as_mut() else {
            return Err(ClientError::Closed);
        };
        management.renew_lock(token).await
    }

    async fn close(mut self) -> Result<(), ClientError> {
        let management = match self.management.take() {
            Some(link) => link.close().await,
            None => Ok(()),
        };
        let detached = self
            .receiver
            .close()
            .await
            .map_err(|err| ClientError::Close(err.to_string()));
        let ended = self
            .session
            .end()
            .await
            .map_err(|err| ClientError::Close(err.to_string()));
        let closed = super::close_connection(self.connection).await;
        management.and(detached).and(ended).and(closed)
    }
}

/// Service Bus delivery tags are lock tokens, a GUID in .NET byte order
fn lock_token(delivery_tag: &[u8]) -> Option<uuid::Uuid> {
    <[u8; 16]>::try_from(delivery_tag)
        .ok()
        .map(uuid::Uuid::from_bytes_le)
}

fn annotated_lock_token(message: &Message<Body<Value>>) -> Option<uuid::Uuid> {
    message
        .message_annotations
        .as_ref()?
        .iter()
        .find_map(|(key, value)| match (key, value) {
            (OwnedKey::Symbol(symbol), Value::Uuid(token)) if symbol.0 == LOCK_TOKEN => {
                Some(uuid::Uuid::from_bytes(*token.as_inner()))
            }
            _ => None,
        })
}

fn body_bytes(body: &Body<Value>) -> Vec<u8> {
    if let Ok(sections) = body.try_as_data() {
        return sections.flat_map(|data| data.iter().copied()).collect();
    }
    match body.try_as_value() {
        Ok(Value::String(text)) => text.clone().into_bytes(),
        Ok(Value::Binary(bytes)) => bytes.to_vec(),
        _ => Vec::new(),
    }
}

fn timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Timestamp(timestamp) => DateTime::from_timestamp_millis(timestamp.milliseconds()),
        _ => None,
    }
}

fn received_message(message: &Message<Body<Value>>) -> ReceivedMessage {
    let mut received = ReceivedMessage {
        body: body_bytes(&message.body),
        ..Default::default()
    };

    if let Some(properties) = &message.properties {
        received.message_id = properties.message_id.as_ref().map(|id| match id {
            MessageId::String(id) => id.clone(),
            MessageId::Ulong(id) => id.to_string(),
            other => format!("{other:?}"),
        });
        received.label = properties.subject.clone();
        received.content_type = properties
            .content_type
            .as_ref()
            .map(|content_type| content_type.0.clone());
        received.expires_at = properties
            .absolute_expiry_time
            .as_ref()
            .and_then(|expiry| DateTime::from_timestamp_millis(expiry.milliseconds()));
    }

    if let Some(annotations) = &message.message_annotations {
        for (key, value) in annotations.iter() {
            let OwnedKey::Symbol(symbol) = key else {
                continue;
            };
            match symbol.0.as_str() {
                SEQUENCE_NUMBER => {
                    if let Value::Long(sequence_number) = value {
                        received.sequence_number = Some(*sequence_number);
                    }
                }
                ENQUEUED_TIME => received.enqueued_time = timestamp(value),
                LOCKED_UNTIL => received.locked_until = timestamp(value),
                _ => {}
            }
        }
    }

    if received.expires_at.is_none() {
        let ttl = message.header.as_ref().and_then(|header| header.ttl);
        if let (Some(enqueued), Some(ttl)) = (received.enqueued_time, ttl) {
            received.expires_at = Some(enqueued + ChronoDuration::milliseconds(i64::from(ttl)));
        }
    }

    received
}
