//! Request/response link to the `$management` node of a queue

use chrono::{DateTime, Utc};
use fe2o3_amqp::{
    session::SessionHandle,
    types::{
        messaging::{AmqpValue, ApplicationProperties, Message},
        primitives::{Array, OrderedMap, Value},
    },
};
use fe2o3_amqp_management::{
    client::MgmtClient, error::Error as ManagementError, request::Request, response::Response,
};

use crate::error::ClientError;

const RENEW_LOCK: &str = "com.microsoft:renew-lock";
const ASSOCIATED_LINK_NAME: &str = "associated-link-name";
const LOCK_TOKENS: &str = "lock-tokens";
const EXPIRATIONS: &str = "expirations";

/// Asks the queue to extend the locks identified by `lock_tokens`
///
/// `associated_link_name` names the receiving link the locks were taken on, so the service can
/// route the request to the same broker instance.
#[derive(Debug)]
pub(crate) struct RenewLockRequest {
    pub lock_tokens: Vec<uuid::Uuid>,
    pub associated_link_name: Option<String>,
}

impl Request for RenewLockRequest {
    const OPERATION: &'static str = RENEW_LOCK;

    type Response = RenewLockResponse;
    type Body = AmqpValue<Value>;

    fn encode_application_properties(&mut self) -> Option<ApplicationProperties> {
        self.associated_link_name.take().map(|link_name| {
            ApplicationProperties::builder()
                .insert(ASSOCIATED_LINK_NAME, link_name)
                .build()
        })
    }

    fn encode_body(self) -> Self::Body {
        let tokens = self
            .lock_tokens
            .iter()
            .map(|token| Value::Uuid((*token.as_bytes()).into()))
            .collect();
        let mut body = OrderedMap::new();
        body.insert(
            Value::String(LOCK_TOKENS.to_string()),
            Value::Array(Array(tokens)),
        );
        AmqpValue(Value::Map(body))
    }
}

/// New expiry of every renewed lock, in request order
#[derive(Debug)]
pub(crate) struct RenewLockResponse {
    pub expirations: Vec<DateTime<Utc>>,
}

impl Response for RenewLockResponse {
    const STATUS_CODE: u16 = 200;

    type Body = AmqpValue<Value>;

    type Error = ManagementError;

    fn decode_message(message: Message<Self::Body>) -> Result<Self, Self::Error> {
        Ok(Self {
            expirations: expirations(&message.body.0),
        })
    }
}

fn expirations(body: &Value) -> Vec<DateTime<Utc>> {
    let Value::Map(map) = body else {
        return Vec::new();
    };
    match map.get(&Value::String(EXPIRATIONS.to_string())) {
        Some(Value::Array(Array(expirations))) => expirations
            .iter()
            .filter_map(|value| match value {
                Value::Timestamp(timestamp) => {
                    DateTime::from_timestamp_millis(timestamp.milliseconds())
                }
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Management client bound to one receiving link
#[derive(Debug)]
pub(crate) struct ManagementLink {
    client: MgmtClient,
    associated_link_name: String,
}

impl ManagementLink {
    pub(crate) async fn attach(
        session: &mut SessionHandle<()>,
        entity: &str,
        associated_link_name: &str,
    ) -> Result<Self, ClientError> {
        let client = MgmtClient::builder()
            .management_node_address(format!("{entity}/$management"))
            .client_node_addr(format!("{associated_link_name}-management"))
            .attach(session)
            .await?;
        tracing::debug!(entity, associated_link_name, "management link attached");
        Ok(Self {
            client,
            associated_link_name: associated_link_name.to_string(),
        })
    }

    /// Renews the lock identified by `lock_token` and returns the new expiry
    ///
    /// Responses are matched to requests by order, so a call must not be dropped before it
    /// completes.
    pub(crate) async fn renew_lock(
        &mut self,
        lock_token: uuid::Uuid,
    ) -> Result<Option<DateTime<Utc>>, ClientError> {
        let request = RenewLockRequest {
            lock_tokens: vec![lock_token],
            associated_link_name: Some(self.associated_link_name.clone()),
        };
        let response: RenewLockResponse = self.client.call(request).await?;
        Ok(response.expirations.into_iter().next())
    }

    pub(crate) async fn close(self) -> Result<(), ClientError> {
        self.client
            .close()
            .await
            .map_err(|err| ClientError::Close(err.to_string()))
    }
}
