//! Fleet-wide reboot coordination.
//!
//! Requests and responses share one channel and are told apart by
//! `isRequest`; `id` pairs a response with its request. How responses are
//! combined is up to the workers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use super::publisher::Publisher;
use crate::store::Command;
use crate::utils::BusError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebootMessage {
    pub id: String,
    pub is_request: bool,
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
}

impl Publisher {
    pub async fn request_reboot(&self, id: &str, priority: Value) -> Result<(), BusError> {
        let message = RebootMessage {
            id: id.to_string(),
            is_request: true,
            token: self.settings.worker_token.clone(),
            priority: Some(priority),
            response: None,
        };
        self.publish_reboot(message).await?;
        info!(id, "reboot requested");
        Ok(())
    }

    pub async fn reply_to_reboot_request(&self, id: &str, response: Value) -> Result<(), BusError> {
        let message = RebootMessage {
            id: id.to_string(),
            is_request: false,
            token: self.settings.worker_token.clone(),
            priority: None,
            response: Some(response),
        };
        self.publish_reboot(message).await
    }

    async fn publish_reboot(&self, message: RebootMessage) -> Result<(), BusError> {
        let payload = serde_json::to_string(&message)?;
        self.query("reboot", Command::publish(self.names.reboot(), payload))
            .await?;
        Ok(())
    }
}
