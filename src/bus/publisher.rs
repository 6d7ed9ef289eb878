use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::attachment::AttachmentStore;
use super::check_replies;
use super::codec::Codec;
use super::subscriber::{Side, Subscriber, Subscription};
use crate::config::BusSettings;
use crate::naming::Names;
use crate::store::{Command, Connection, Reply, ScriptHandle, Store};
use crate::utils::BusError;

/// A bus instance in command mode.
///
/// Owns one store connection, shared by all calls through an async lock.
/// Every store failure is logged here before being returned.
pub struct Publisher {
    pub(super) store: Arc<dyn Store>,
    pub(super) connection: Mutex<Box<dyn Connection>>,
    pub(super) names: Names,
    pub(super) settings: BusSettings,
    pub(super) codec: Codec,
    pub(super) claim_script: Option<ScriptHandle>,
}

impl Publisher {
    pub async fn connect(store: Arc<dyn Store>, settings: BusSettings) -> Result<Self, BusError> {
        let connection = store.connect().await?;
        let names = Names::new(settings.namespace.as_str());
        let attachments = AttachmentStore::new(store.clone(), names.clone(), settings.expiry());
        let codec = Codec::new(settings.max_payload_size, attachments);

        debug!(namespace = %settings.namespace, "bus connected");
        Ok(Self {
            store,
            connection: Mutex::new(connection),
            names,
            settings,
            codec,
            claim_script: None,
        })
    }

    pub fn names(&self) -> &Names {
        &self.names
    }

    pub fn settings(&self) -> &BusSettings {
        &self.settings
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Front end to worker traffic.
    pub async fn publish_input<T: Serialize + ?Sized>(
        &self,
        code: &str,
        name: &str,
        content: &T,
    ) -> Result<(), BusError> {
        self.publish_envelope(Side::Input, code, name, content).await
    }

    /// Worker to front end traffic.
    pub async fn publish_output<T: Serialize + ?Sized>(
        &self,
        code: &str,
        name: &str,
        content: &T,
    ) -> Result<(), BusError> {
        self.publish_envelope(Side::Output, code, name, content).await
    }

    async fn publish_envelope<T: Serialize + ?Sized>(
        &self,
        side: Side,
        code: &str,
        name: &str,
        content: &T,
    ) -> Result<(), BusError> {
        let envelope = self.codec.serialize(name, content)?;
        let payload = serde_json::to_string(&envelope)?;
        let channel = self.names.of(side.kind(), code);
        self.query("publish", Command::publish(channel, payload))
            .await?;
        Ok(())
    }

    /// Switch this instance to subscriber mode. The instance is consumed,
    /// so no further commands can be issued through it.
    pub async fn subscribe(self, subscription: Subscription) -> Result<Subscriber, BusError> {
        self.try_subscribe(subscription)
            .await
            .map_err(|(_, e)| e)
    }

    /// Like `subscribe`, but hands the publisher back when the store refuses
    /// the subscription.
    pub async fn try_subscribe(
        self,
        subscription: Subscription,
    ) -> Result<Subscriber, (Self, BusError)> {
        let target = subscription.target(&self.names);
        let subscribed = match self.store.connect().await {
            Ok(connection) => connection.subscribe(target).await,
            Err(e) => Err(e),
        };
        let notifications = match subscribed {
            Ok(notifications) => notifications,
            Err(e) => {
                warn!(?subscription, error = %e, "subscription failed");
                return Err((self, e.into()));
            }
        };

        debug!(?subscription, mode = %subscription.mode(), "bus subscribed");
        Ok(Subscriber::new(
            subscription,
            notifications,
            self.names,
            self.codec,
        ))
    }

    pub(super) async fn query(&self, op: &'static str, command: Command) -> Result<Reply, BusError> {
        let result = self
            .connection
            .lock()
            .await
            .query(command)
            .await
            .map_err(BusError::from);
        self.logged(op, result)
    }

    pub(super) async fn exec(
        &self,
        op: &'static str,
        commands: Vec<Command>,
    ) -> Result<Vec<Reply>, BusError> {
        let result = self.connection.lock().await.exec(commands).await;
        let result = result
            .map_err(BusError::from)
            .and_then(|replies| check_replies(op, replies));
        self.logged(op, result)
    }

    pub(super) async fn eval(
        &self,
        op: &'static str,
        script: &ScriptHandle,
        keys: Vec<String>,
        args: Vec<String>,
    ) -> Result<Reply, BusError> {
        let result = self
            .connection
            .lock()
            .await
            .eval(script, keys, args)
            .await
            .map_err(BusError::from);
        self.logged(op, result)
    }

    fn logged<T>(&self, op: &'static str, result: Result<T, BusError>) -> Result<T, BusError> {
        if let Err(e) = &result {
            warn!(op, error = %e, "store operation failed");
        }
        result
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("namespace", &self.settings.namespace)
            .field("claims_enabled", &self.claim_script.is_some())
            .finish()
    }
}
