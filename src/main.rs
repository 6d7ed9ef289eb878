//! Loopback smoke run.
//!
//! Wires a front end and a worker to the configured store (Redis when
//! `store.url` is set, otherwise an in-process store) and walks one session
//! through its whole life: enqueue, claim, input, an output large enough to
//! travel as an attachment, and worker teardown. Every bus event is logged.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sessionbus::bus::{BusEvent, Publisher, Subscription};
use sessionbus::config::{BusSettings, StoreSettings, load_config};
use sessionbus::store::{MemoryStore, RedisStore, Store};
use sessionbus::utils::{BusError, logging};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const EVENT_WAIT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return;
        }
    };
    logging::init(&config.log.level);

    if let Err(e) = run(config.bus, config.store).await {
        error!("Smoke run failed: {}", e);
    }
}

fn open_store(settings: &StoreSettings) -> Result<Arc<dyn Store>, BusError> {
    match &settings.url {
        Some(url) => {
            info!("Using shared store at {}", url);
            Ok(Arc::new(RedisStore::open(url)?))
        }
        None => {
            info!("No store url configured, using an in-process store");
            let memory = MemoryStore::new();
            // The reaper stops once the store is dropped.
            drop(memory.spawn_reaper(Duration::from_secs(1)));
            Ok(Arc::new(memory))
        }
    }
}

async fn run(settings: BusSettings, store_settings: StoreSettings) -> Result<(), BusError> {
    let store = open_store(&store_settings)?;

    let (tx, mut events) = mpsc::unbounded_channel();
    for subscription in [
        Subscription::Input,
        Subscription::Output,
        Subscription::DestroyByWorker,
    ] {
        Publisher::connect(store.clone(), settings.clone())
            .await?
            .subscribe(subscription)
            .await?
            .forward(tx.clone());
    }
    drop(tx);

    let frontend = Publisher::connect(store.clone(), settings.clone()).await?;
    let mut worker = Publisher::connect(store, settings.clone()).await?;
    worker.enable_claims().await?;

    let code = uuid::Uuid::new_v4().to_string();
    frontend
        .enqueue_now(&code, &json!({ "kernel": "python3" }).to_string())
        .await?;

    let Some(claim) = worker.claim().await? else {
        warn!("Nothing to claim");
        return Ok(());
    };
    info!(session = %claim.session, content = %claim.content, "Claimed session");
    worker.set_live(&claim.session).await?;

    frontend
        .publish_input(&code, "execute", &json!({ "code": "print('hi')" }))
        .await?;
    frontend.touch_input(&code).await?;
    log_next(&mut events).await?;

    let big = "x".repeat(settings.max_payload_size * 4);
    worker
        .publish_output(&code, "stream", &json!({ "text": big }))
        .await?;
    worker.touch_output(&code).await?;
    log_next(&mut events).await?;

    worker.teardown_by_worker(&code, "smoke run complete").await?;
    log_next(&mut events).await?;

    info!("Smoke run finished");
    Ok(())
}

async fn log_next(events: &mut mpsc::UnboundedReceiver<BusEvent>) -> Result<(), BusError> {
    let event = match tokio::time::timeout(EVENT_WAIT, events.recv()).await {
        Ok(Some(event)) => event,
        Ok(None) => {
            warn!("Event channel closed");
            return Ok(());
        }
        Err(_) => {
            warn!("No event within {:?}", EVENT_WAIT);
            return Ok(());
        }
    };

    match event {
        BusEvent::Message {
            side,
            session,
            name,
            data,
        } => {
            let attachment = data.attachment_id().map(str::to_string);
            let value = data.resolve().await?;
            info!(
                ?side,
                %session,
                %name,
                ?attachment,
                bytes = value.to_string().len(),
                "Message received"
            );
        }
        BusEvent::DestroyByWorker(notice) | BusEvent::DestroyByUser(notice) => {
            info!(session = %notice.sess_code, reason = %notice.message, "Session destroyed");
        }
        BusEvent::Expired { session, key } => {
            info!(%session, %key, "Session expired");
        }
        BusEvent::RebootRequest(message) => {
            info!(id = %message.id, request = message.is_request, "Reboot message");
        }
    }
    Ok(())
}
