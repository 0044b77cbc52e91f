use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::auth::Credential;
use crate::errors::TransportError;
use crate::message::Message;

/// Notifications pushed by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(Message),
    Disconnect(TransportError),
}

/// Transport-level knobs forwarded through `set_options`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransportOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_secs")]
    pub keep_alive: Option<Duration>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

mod opt_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}

/// Device-side protocol connection (AMQP, MQTT, HTTP...). Implementations own
/// the wire; the session only decides when cloud-to-device delivery must be on.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Starts delivery of cloud-to-device messages.
    async fn enable_c2d(&self) -> Result<(), TransportError>;

    /// Stops delivery of cloud-to-device messages.
    async fn disable_c2d(&self) -> Result<(), TransportError>;

    async fn update_credential(&self, credential: Credential) -> Result<(), TransportError>;

    async fn set_options(&self, options: TransportOptions) -> Result<(), TransportError>;

    /// Subscribes to messages and disconnect notifications.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}

pub type SharedTransport = Arc<dyn Transport>;
