//! Subscriber-mode bus instances.
//!
//! A subscriber listens to exactly one thing, chosen when it is created, and
//! turns raw store notifications into `BusEvent`s. Payloads that fail to
//! parse are logged and skipped; the subscription keeps running.

use std::fmt;

use futures::stream::BoxStream;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::codec::{Codec, Envelope, LazyContent};
use super::queue::DestroyNotice;
use super::reboot::RebootMessage;
use crate::naming::{NameKind, Names};
use crate::store::{Notification, NotificationStream, SubscribeTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subscription {
    /// Traffic from front ends to workers, all sessions.
    Input,
    /// Traffic from workers to front ends, all sessions.
    Output,
    DestroyByWorker,
    DestroyByUser,
    RebootRequests,
    /// Session records and traffic markers removed by the store's TTL.
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionMode {
    Exact,
    Pattern,
    Expiry,
}

impl fmt::Display for SubscriptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SubscriptionMode::Exact => "exact",
            SubscriptionMode::Pattern => "pattern",
            SubscriptionMode::Expiry => "expiry",
        })
    }
}

impl Subscription {
    pub fn mode(self) -> SubscriptionMode {
        match self {
            Subscription::Input | Subscription::Output => SubscriptionMode::Pattern,
            Subscription::DestroyByWorker
            | Subscription::DestroyByUser
            | Subscription::RebootRequests => SubscriptionMode::Exact,
            Subscription::Expired => SubscriptionMode::Expiry,
        }
    }

    pub(super) fn target(self, names: &Names) -> SubscribeTarget {
        match self {
            Subscription::Input => SubscribeTarget::Patterns(vec![names.input_pattern()]),
            Subscription::Output => SubscribeTarget::Patterns(vec![names.output_pattern()]),
            Subscription::DestroyByWorker => {
                SubscribeTarget::Channels(vec![names.destroy_by_worker()])
            }
            Subscription::DestroyByUser => SubscribeTarget::Channels(vec![names.destroy_by_user()]),
            Subscription::RebootRequests => SubscribeTarget::Channels(vec![names.reboot()]),
            Subscription::Expired => SubscribeTarget::Expirations,
        }
    }
}

/// Direction of session traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Input,
    Output,
}

impl Side {
    pub(super) fn kind(self) -> NameKind {
        match self {
            Side::Input => NameKind::Input,
            Side::Output => NameKind::Output,
        }
    }
}

#[derive(Debug)]
pub enum BusEvent {
    Message {
        side: Side,
        session: String,
        name: String,
        data: LazyContent,
    },
    DestroyByWorker(DestroyNotice),
    DestroyByUser(DestroyNotice),
    Expired {
        session: String,
        key: String,
    },
    /// Both requests and responses; see `RebootMessage::is_request`.
    RebootRequest(RebootMessage),
}

pub struct Subscriber {
    subscription: Subscription,
    notifications: NotificationStream,
    names: Names,
    codec: Codec,
}

impl Subscriber {
    pub(super) fn new(
        subscription: Subscription,
        notifications: NotificationStream,
        names: Names,
        codec: Codec,
    ) -> Self {
        Self {
            subscription,
            notifications,
            names,
            codec,
        }
    }

    pub fn subscription(&self) -> Subscription {
        self.subscription
    }

    pub fn mode(&self) -> SubscriptionMode {
        self.subscription.mode()
    }

    /// Next event, or `None` once the store closes the subscription.
    pub async fn next_event(&mut self) -> Option<BusEvent> {
        while let Some(notification) = self.notifications.next().await {
            if let Some(event) = self.translate(notification) {
                return Some(event);
            }
        }
        None
    }

    pub fn into_stream(self) -> BoxStream<'static, BusEvent> {
        futures::stream::unfold(self, |mut subscriber| async move {
            subscriber
                .next_event()
                .await
                .map(|event| (event, subscriber))
        })
        .boxed()
    }

    /// Spawn a task delivering every event to `sender` until either side
    /// goes away.
    pub fn forward(mut self, sender: UnboundedSender<BusEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = self.next_event().await {
                if sender.send(event).is_err() {
                    debug!(subscription = ?self.subscription, "event receiver dropped");
                    break;
                }
            }
        })
    }

    fn translate(&self, notification: Notification) -> Option<BusEvent> {
        match self.subscription {
            Subscription::Input => self.message(Side::Input, notification),
            Subscription::Output => self.message(Side::Output, notification),
            Subscription::DestroyByWorker => {
                parse::<DestroyNotice>(&notification).map(BusEvent::DestroyByWorker)
            }
            Subscription::DestroyByUser => {
                parse::<DestroyNotice>(&notification).map(BusEvent::DestroyByUser)
            }
            Subscription::RebootRequests => {
                parse::<RebootMessage>(&notification).map(BusEvent::RebootRequest)
            }
            Subscription::Expired => {
                // Most expiring keys belong to someone else.
                let key = notification.payload;
                let session = self.names.session_code(&key)?.to_string();
                Some(BusEvent::Expired { session, key })
            }
        }
    }

    fn message(&self, side: Side, notification: Notification) -> Option<BusEvent> {
        let parsed = self.names.parse(&notification.channel);
        let Some(parsed) = parsed.filter(|p| p.kind == side.kind()) else {
            warn!(channel = %notification.channel, "message on unrecognised channel dropped");
            return None;
        };
        let envelope = parse::<Envelope>(&notification)?;
        Some(BusEvent::Message {
            side,
            session: parsed.code.to_string(),
            data: self.codec.deserialize(&envelope),
            name: envelope.name,
        })
    }
}

fn parse<T: DeserializeOwned>(notification: &Notification) -> Option<T> {
    match serde_json::from_str(&notification.payload) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(
                channel = %notification.channel,
                error = %e,
                "malformed payload dropped"
            );
            None
        }
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("subscription", &self.subscription)
            .finish()
    }
}
