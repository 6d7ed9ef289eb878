//! Out-of-band transfer for payloads too large to travel inline.
//!
//! Each attachment is a one-element list under `attachment:{id}` with its own
//! TTL. Reads rotate the element back onto the same list instead of removing
//! it, so a retry sees the same content until the TTL reclaims the key.
//! Every call opens its own connection because the owning bus connection may
//! be in subscriber mode.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::check_replies;
use crate::naming::Names;
use crate::store::{Command, Store};
use crate::utils::BusError;

/// Returned by `get` when nothing arrives within the expiry window.
pub const NULL_CONTENT: &str = "null";

#[derive(Debug, Clone)]
pub struct AttachmentStore {
    store: Arc<dyn Store>,
    names: Names,
    expiry: Duration,
}

impl AttachmentStore {
    pub fn new(store: Arc<dyn Store>, names: Names, expiry: Duration) -> Self {
        Self {
            store,
            names,
            expiry,
        }
    }

    pub async fn put(&self, id: &str, content: &str) -> Result<(), BusError> {
        let key = self.names.attachment(id);
        let mut conn = self.store.connect().await?;
        let replies = conn
            .exec(vec![
                Command::RPush {
                    key: key.clone(),
                    value: content.to_string(),
                },
                Command::expire(key, self.expiry),
            ])
            .await?;
        check_replies("attachment put", replies)?;
        Ok(())
    }

    /// Waits up to the expiry window; a timeout yields `NULL_CONTENT`.
    pub async fn get(&self, id: &str) -> Result<String, BusError> {
        let key = self.names.attachment(id);
        let mut conn = self.store.connect().await?;
        let popped = conn.brpoplpush(&key, &key, self.expiry).await?;
        if popped.is_none() {
            debug!(attachment = %id, "attachment fetch timed out");
        }
        Ok(popped.unwrap_or_else(|| NULL_CONTENT.to_string()))
    }

    /// Upload without waiting. Failures, including the task being dropped
    /// before it finishes, are logged.
    pub(crate) fn spawn_put(&self, id: String, content: String) -> JoinHandle<()> {
        let attachments = self.clone();
        tokio::spawn(async move {
            let mut guard = UploadGuard {
                id: id.clone(),
                finished: false,
            };
            match attachments.put(&id, &content).await {
                Ok(()) => debug!(attachment = %id, bytes = content.len(), "attachment stored"),
                Err(e) => warn!(attachment = %id, error = %e, "attachment upload failed"),
            }
            guard.finished = true;
        })
    }
}

struct UploadGuard {
    id: String,
    finished: bool,
}

impl Drop for UploadGuard {
    fn drop(&mut self) {
        if !self.finished {
            warn!(attachment = %self.id, "attachment upload abandoned before completion");
        }
    }
}
