//! Message envelopes.
//!
//! An envelope carries a message name plus either the content inline
//! (`data`) or the id of an attachment holding it. Content whose JSON form
//! exceeds `max_payload_size` bytes always takes the attachment path.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::error;
use uuid::Uuid;

use super::attachment::AttachmentStore;
use crate::utils::BusError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "WireEnvelope", try_from = "WireEnvelope")]
pub struct Envelope {
    pub name: String,
    pub body: Body,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Data(Value),
    Attachment(String),
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    name: String,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    attachment: Option<String>,
}

// `data: null` is present content, not a missing field.
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl From<Envelope> for WireEnvelope {
    fn from(envelope: Envelope) -> Self {
        let (data, attachment) = match envelope.body {
            Body::Data(value) => (Some(value), None),
            Body::Attachment(id) => (None, Some(id)),
        };
        Self {
            name: envelope.name,
            data,
            attachment,
        }
    }
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = BusError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        let body = match (wire.data, wire.attachment) {
            (Some(value), None) => Body::Data(value),
            (None, Some(id)) => Body::Attachment(id),
            (Some(_), Some(_)) => {
                return Err(BusError::Envelope("both data and attachment".to_string()));
            }
            (None, None) => {
                return Err(BusError::Envelope("neither data nor attachment".to_string()));
            }
        };
        Ok(Envelope {
            name: wire.name,
            body,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Codec {
    max_payload_size: usize,
    attachments: AttachmentStore,
}

impl Codec {
    pub fn new(max_payload_size: usize, attachments: AttachmentStore) -> Self {
        Self {
            max_payload_size,
            attachments,
        }
    }

    pub fn attachments(&self) -> &AttachmentStore {
        &self.attachments
    }

    /// Build the envelope for `content`. Oversized content is uploaded in
    /// the background and referenced by a fresh attachment id; the upload
    /// is not awaited. Must be called from within a tokio runtime.
    pub fn serialize<T: Serialize + ?Sized>(
        &self,
        name: &str,
        content: &T,
    ) -> Result<Envelope, BusError> {
        if name.len() > self.max_payload_size {
            error!(
                len = name.len(),
                max = self.max_payload_size,
                "message name too long, send aborted"
            );
            return Err(BusError::NameTooLong {
                len: name.len(),
                max: self.max_payload_size,
            });
        }

        let value = serde_json::to_value(content)?;
        let serialized = serde_json::to_string(&value)?;
        if serialized.len() <= self.max_payload_size {
            return Ok(Envelope {
                name: name.to_string(),
                body: Body::Data(value),
            });
        }

        let id = Uuid::new_v4().to_string();
        self.attachments.spawn_put(id.clone(), serialized);
        Ok(Envelope {
            name: name.to_string(),
            body: Body::Attachment(id),
        })
    }

    pub fn deserialize(&self, envelope: &Envelope) -> LazyContent {
        let source = match &envelope.body {
            Body::Data(value) => Source::Inline(value.clone()),
            Body::Attachment(id) => Source::Attachment {
                id: id.clone(),
                attachments: self.attachments.clone(),
            },
        };
        LazyContent { source }
    }
}

/// Message content that may still have to be fetched.
#[derive(Debug, Clone)]
pub struct LazyContent {
    source: Source,
}

#[derive(Debug, Clone)]
enum Source {
    Inline(Value),
    Attachment {
        id: String,
        attachments: AttachmentStore,
    },
}

impl LazyContent {
    pub fn attachment_id(&self) -> Option<&str> {
        match &self.source {
            Source::Inline(_) => None,
            Source::Attachment { id, .. } => Some(id),
        }
    }

    /// Inline content resolves after one yield to the scheduler. Attachment
    /// content resolves to `Value::Null` if it never arrived.
    pub async fn resolve(self) -> Result<Value, BusError> {
        match self.source {
            Source::Inline(value) => {
                tokio::task::yield_now().await;
                Ok(value)
            }
            Source::Attachment { id, attachments } => {
                let raw = attachments.get(&id).await?;
                Ok(serde_json::from_str(&raw)?)
            }
        }
    }

    pub async fn decode<T: DeserializeOwned>(self) -> Result<T, BusError> {
        Ok(serde_json::from_value(self.resolve().await?)?)
    }
}
