//! The session bus.
//!
//! A bus instance is either a `Publisher`, which issues commands (queue,
//! lifecycle, traffic, reboot coordination), or a `Subscriber`, which only
//! receives events. A publisher becomes a subscriber by consuming itself;
//! there is no way back. `Bus` wraps both for callers that hold an instance
//! whose role is decided at runtime.

pub mod attachment;
pub mod codec;
pub mod publisher;
pub mod queue;
pub mod reboot;
pub mod session;
pub mod subscriber;

use std::sync::Arc;

pub use attachment::{AttachmentStore, NULL_CONTENT};
pub use codec::{Body, Codec, Envelope, LazyContent};
pub use publisher::Publisher;
pub use queue::{CLAIM_SCRIPT, Claim, DestroyNotice};
pub use reboot::RebootMessage;
pub use subscriber::{BusEvent, Side, Subscriber, Subscription, SubscriptionMode};

use crate::config::BusSettings;
use crate::store::{Reply, Store};
use crate::utils::BusError;

#[derive(Debug)]
pub enum Bus {
    Publisher(Publisher),
    Subscriber(Subscriber),
}

impl Bus {
    pub async fn connect(store: Arc<dyn Store>, settings: BusSettings) -> Result<Self, BusError> {
        Ok(Bus::Publisher(Publisher::connect(store, settings).await?))
    }

    /// Command access. Fails immediately once the instance has subscribed.
    pub fn publisher(&self) -> Result<&Publisher, BusError> {
        match self {
            Bus::Publisher(publisher) => Ok(publisher),
            Bus::Subscriber(_) => Err(BusError::Subscribed),
        }
    }

    pub fn publisher_mut(&mut self) -> Result<&mut Publisher, BusError> {
        match self {
            Bus::Publisher(publisher) => Ok(publisher),
            Bus::Subscriber(_) => Err(BusError::Subscribed),
        }
    }

    pub fn subscriber_mut(&mut self) -> Option<&mut Subscriber> {
        match self {
            Bus::Publisher(_) => None,
            Bus::Subscriber(subscriber) => Some(subscriber),
        }
    }

    pub fn mode(&self) -> Option<SubscriptionMode> {
        match self {
            Bus::Publisher(_) => None,
            Bus::Subscriber(subscriber) => Some(subscriber.mode()),
        }
    }

    /// One-way switch to subscriber mode.
    ///
    /// On failure the instance comes back unchanged with the error: a second
    /// call on a subscribed instance fails before touching the store and
    /// leaves the live subscription running.
    pub async fn subscribe(self, subscription: Subscription) -> Result<Self, (Self, BusError)> {
        match self {
            Bus::Publisher(publisher) => match publisher.try_subscribe(subscription).await {
                Ok(subscriber) => Ok(Bus::Subscriber(subscriber)),
                Err((publisher, e)) => Err((Bus::Publisher(publisher), e)),
            },
            Bus::Subscriber(subscriber) => {
                let mode = subscriber.mode();
                Err((Bus::Subscriber(subscriber), BusError::AlreadySubscribed { mode }))
            }
        }
    }
}

/// Transactions report per-command failures inline; surface the first one.
pub(crate) fn check_replies(op: &'static str, replies: Vec<Reply>) -> Result<Vec<Reply>, BusError> {
    if let Some(Reply::Error(message)) = replies.iter().find(|r| matches!(r, Reply::Error(_))) {
        return Err(BusError::UnexpectedReply {
            op,
            reply: message.clone(),
        });
    }
    Ok(replies)
}

#[cfg(test)]
mod tests;
