use fe2o3_amqp::{
    connection::ConnectionHandle,
    session::SessionHandle,
    types::{
        messaging::{Data, Header, Message, MessageId, Properties},
        primitives::{Binary, Symbol},
    },
    Sender, Session,
};
use futures_util::{future::BoxFuture, FutureExt};

use crate::{client::MessageSink, error::ClientError, message::OutgoingMessage};

/// Sends to a queue over its own connection, session and sending link
#[derive(Debug)]
pub struct AmqpSink {
    connection: ConnectionHandle<()>,
    session: SessionHandle<()>,
    sender: Sender,
}

impl AmqpSink {
    /// Attaches a sending link to `queue` on an open connection
    pub async fn attach(
        mut connection: ConnectionHandle<()>,
        queue: &str,
    ) -> Result<Self, ClientError> {
        let mut session = Session::begin(&mut connection).await?;
        let link_name = format!("{queue}-sender-{}", uuid::Uuid::new_v4());
        let sender = Sender::attach(&mut session, link_name, queue).await?;
        Ok(Self {
            connection,
            session,
            sender,
        })
    }
}

/// Maps an outgoing message onto the AMQP message sections
///
/// The label is carried as `subject` and the body as a single data section.
fn to_amqp_message(message: OutgoingMessage) -> Message<Data> {
    let ttl = u32::try_from(message.time_to_live.as_millis()).unwrap_or(u32::MAX);
    Message::builder()
        .header(Header::builder().ttl(Some(ttl)).build())
        .properties(
            Properties::builder()
                .message_id(MessageId::String(message.message_id))
                .subject(message.label)
                .content_type(Symbol::from(message.content_type))
                .build(),
        )
        .data(Binary::from(message.body))
        .build()
}

impl MessageSink for AmqpSink {
    type Ack = BoxFuture<'static, Result<(), ClientError>>;

    async fn dispatch(&mut self, message: OutgoingMessage) -> Result<Self::Ack, ClientError> {
        let delivery = self.sender.send_batchable(to_amqp_message(message)).await?;
        Ok(async move {
            let outcome = delivery.await?;
            outcome.accepted_or_else(|outcome| ClientError::NotAccepted(format!("{outcome:?}")))?;
            Ok(())
        }
        .boxed())
    }

    async fn close(mut self) -> Result<(), ClientError> {
        let detached = self
            .sender
            .close()
            .await
            .map_err(|err| ClientError::Close(err.to_string()));
        let ended = self
            .session
            .end()
            .await
            .map_err(|err| ClientError::Close(err.to_string()));
        let closed = super::close_connection(self.connection).await;
        detached.and(ended).and(closed)
    }
}
