use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use super::{
    Body, Bus, BusEvent, Claim, DestroyNotice, Envelope, NULL_CONTENT, Publisher, RebootMessage,
    Side, Subscriber, Subscription, SubscriptionMode,
};
use crate::config::BusSettings;
use crate::store::{Command, MemoryStore, RedisStore, Reply, Store};
use crate::utils::BusError;

fn settings() -> BusSettings {
    BusSettings {
        namespace: "test".to_string(),
        max_payload_size: 1024,
        expiry_secs: 60,
        worker_token: "worker-1".to_string(),
    }
}

fn memory_store() -> (MemoryStore, Arc<dyn Store>) {
    let memory = MemoryStore::new();
    let store: Arc<dyn Store> = Arc::new(memory.clone());
    (memory, store)
}

async fn publisher(store: &Arc<dyn Store>) -> Publisher {
    Publisher::connect(store.clone(), settings()).await.unwrap()
}

async fn worker(store: &Arc<dyn Store>) -> Publisher {
    let mut worker = publisher(store).await;
    worker.enable_claims().await.unwrap();
    worker
}

async fn subscriber(store: &Arc<dyn Store>, subscription: Subscription) -> Subscriber {
    publisher(store).await.subscribe(subscription).await.unwrap()
}

async fn next(subscriber: &mut Subscriber) -> BusEvent {
    tokio::time::timeout(Duration::from_secs(5), subscriber.next_event())
        .await
        .expect("timed out waiting for event")
        .expect("subscription closed")
}

async fn raw(store: &Arc<dyn Store>, command: Command) -> Reply {
    store
        .connect()
        .await
        .unwrap()
        .query(command)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_enqueue_claim_set_live_scenario() {
    let (_memory, store) = memory_store();
    let frontend = publisher(&store).await;
    let worker = worker(&store).await;

    let content = json!({ "user": "x" }).to_string();
    frontend.enqueue("abc123", &content, 1000).await.unwrap();

    assert_eq!(
        frontend.pending().await.unwrap(),
        vec![("abc123".to_string(), 1000)]
    );
    assert!(!frontend.is_valid("abc123").await.unwrap());

    let claim = worker.claim().await.unwrap();
    assert_eq!(
        claim,
        Some(Claim {
            session: "abc123".to_string(),
            content: content.clone(),
        })
    );
    assert_eq!(frontend.pending_len().await.unwrap(), 0);

    worker.set_live("abc123").await.unwrap();
    assert!(frontend.is_valid("abc123").await.unwrap());
    assert_eq!(
        frontend.session_content("abc123").await.unwrap(),
        Some(content)
    );

    let names = frontend.names();
    assert_eq!(
        raw(&store, Command::hget(names.session("abc123"), "token")).await,
        Reply::Bulk("worker-1".to_string())
    );
    assert_eq!(
        raw(
            &store,
            Command::Get {
                key: names.input("abc123")
            }
        )
        .await,
        Reply::Bulk("1000".to_string())
    );
}

#[tokio::test]
async fn test_claim_requires_script() {
    let (_memory, store) = memory_store();
    let worker = publisher(&store).await;
    assert!(!worker.claims_enabled());

    let err = worker.claim().await.unwrap_err();
    assert!(matches!(err, BusError::ClaimScriptNotLoaded));
    assert!(err.is_precondition());
}

#[tokio::test]
async fn test_claim_empty_queue_is_none() {
    let (_memory, store) = memory_store();
    let worker = worker(&store).await;
    assert_eq!(worker.claim().await.unwrap(), None);
}

#[tokio::test]
async fn test_claim_is_fifo_with_insertion_order_ties() {
    let (_memory, store) = memory_store();
    let frontend = publisher(&store).await;
    let worker = worker(&store).await;

    frontend.enqueue("zeta", "z", 2000).await.unwrap();
    frontend.enqueue("tie-b", "b", 1000).await.unwrap();
    frontend.enqueue("tie-a", "a", 1000).await.unwrap();
    frontend.enqueue("first", "f", 500).await.unwrap();

    let mut order = Vec::new();
    while let Some(claim) = worker.claim().await.unwrap() {
        order.push(claim.session);
    }
    assert_eq!(order, vec!["first", "tie-b", "tie-a", "zeta"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claimers_never_share_a_session() {
    let (_memory, store) = memory_store();
    let frontend = publisher(&store).await;
    frontend.enqueue("only", "c", 1).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let worker = worker(&store).await;
            worker.claim().await.unwrap()
        }));
    }

    let mut claims = Vec::new();
    for handle in handles {
        if let Some(claim) = handle.await.unwrap() {
            claims.push(claim);
        }
    }
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].session, "only");
    assert_eq!(claims[0].content, "c");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claimers_partition_the_queue() {
    let (_memory, store) = memory_store();
    let frontend = publisher(&store).await;
    for i in 0..40 {
        frontend
            .enqueue(&format!("s{i}"), "c", i)
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..4 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let worker = worker(&store).await;
            let mut mine = Vec::new();
            while let Some(claim) = worker.claim().await.unwrap() {
                mine.push(claim.session);
            }
            mine
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 40);
}

#[tokio::test]
async fn test_teardown_by_worker_is_idempotent() {
    let (_memory, store) = memory_store();
    let frontend = publisher(&store).await;
    let worker = worker(&store).await;
    let mut destroyed = subscriber(&store, Subscription::DestroyByWorker).await;

    frontend.enqueue("abc", "c", 1).await.unwrap();
    worker.teardown_by_worker("abc", "kernel died").await.unwrap();
    worker.teardown_by_worker("abc", "kernel died").await.unwrap();

    assert_eq!(frontend.pending_len().await.unwrap(), 0);
    assert_eq!(frontend.session_content("abc").await.unwrap(), None);
    assert!(!frontend.is_valid("abc").await.unwrap());
    let names = frontend.names();
    for key in [names.input("abc"), names.output("abc")] {
        assert_eq!(raw(&store, Command::Get { key }).await, Reply::Nil);
    }

    for _ in 0..2 {
        match next(&mut destroyed).await {
            BusEvent::DestroyByWorker(notice) => assert_eq!(
                notice,
                DestroyNotice {
                    sess_code: "abc".to_string(),
                    message: "kernel died".to_string(),
                }
            ),
            other => panic!("unexpected event {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_teardown_by_user_before_claim_is_skipped_by_claim() {
    let (_memory, store) = memory_store();
    let frontend = publisher(&store).await;
    let worker = worker(&store).await;
    let mut destroyed = subscriber(&store, Subscription::DestroyByUser).await;

    frontend.enqueue("gone", "g", 1).await.unwrap();
    frontend.enqueue("kept", "k", 2).await.unwrap();
    frontend.teardown_by_user("gone", "tab closed").await.unwrap();
    frontend.teardown_by_user("gone", "tab closed").await.unwrap();

    // The user variant leaves the queue alone.
    assert_eq!(frontend.pending_len().await.unwrap(), 2);

    let claim = worker.claim().await.unwrap().unwrap();
    assert_eq!(claim.session, "kept");
    assert_eq!(worker.claim().await.unwrap(), None);
    assert_eq!(frontend.pending_len().await.unwrap(), 0);

    match next(&mut destroyed).await {
        BusEvent::DestroyByUser(notice) => {
            assert_eq!(notice.sess_code, "gone");
            assert_eq!(notice.message, "tab closed");
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_touch_refreshes_ttls() {
    let (_memory, store) = memory_store();
    let frontend = publisher(&store).await;
    let names = frontend.names().clone();
    let ttl = |key: String| Command::Ttl { key };

    frontend.enqueue("abc", "c", 1).await.unwrap();
    assert_eq!(raw(&store, ttl(names.session("abc"))).await, Reply::Int(-1));

    frontend.touch_input("abc").await.unwrap();
    assert_eq!(raw(&store, ttl(names.session("abc"))).await, Reply::Int(60));
    assert_eq!(raw(&store, ttl(names.input("abc"))).await, Reply::Int(60));
    assert_eq!(raw(&store, ttl(names.output("abc"))).await, Reply::Int(-1));

    tokio::time::advance(Duration::from_secs(30)).await;
    frontend.touch_output("abc").await.unwrap();
    assert_eq!(raw(&store, ttl(names.session("abc"))).await, Reply::Int(60));
    assert_eq!(raw(&store, ttl(names.input("abc"))).await, Reply::Int(30));
    assert_eq!(raw(&store, ttl(names.output("abc"))).await, Reply::Int(60));
}

#[tokio::test(start_paused = true)]
async fn test_expired_events_for_idle_sessions() {
    let (memory, store) = memory_store();
    let frontend = publisher(&store).await;
    let mut expired = subscriber(&store, Subscription::Expired).await;

    frontend.enqueue("idle", "c", 1).await.unwrap();
    frontend.touch_input("idle").await.unwrap();
    store
        .connect()
        .await
        .unwrap()
        .exec(vec![
            Command::set("unrelated:key", "v"),
            Command::expire("unrelated:key", Duration::from_secs(1)),
        ])
        .await
        .unwrap();

    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(memory.purge_expired(), 3);

    let mut keys = Vec::new();
    for _ in 0..2 {
        match next(&mut expired).await {
            BusEvent::Expired { session, key } => {
                assert_eq!(session, "idle");
                keys.push(key);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
    keys.sort();
    let names = frontend.names();
    assert_eq!(keys, vec![names.input("idle"), names.session("idle")]);

    let more = tokio::time::timeout(Duration::from_millis(50), expired.next_event()).await;
    assert!(more.is_err(), "unrelated key must not surface");
}

#[tokio::test]
async fn test_input_messages_reach_workers() {
    let (_memory, store) = memory_store();
    let frontend = publisher(&store).await;
    let mut inbox = subscriber(&store, Subscription::Input).await;
    let mut outbox = subscriber(&store, Subscription::Output).await;

    frontend
        .publish_input("abc", "execute", &json!({ "code": "1 + 1" }))
        .await
        .unwrap();

    match next(&mut inbox).await {
        BusEvent::Message {
            side,
            session,
            name,
            data,
        } => {
            assert_eq!(side, Side::Input);
            assert_eq!(session, "abc");
            assert_eq!(name, "execute");
            assert_eq!(data.attachment_id(), None);
            assert_eq!(data.resolve().await.unwrap(), json!({ "code": "1 + 1" }));
        }
        other => panic!("unexpected event {other:?}"),
    }

    let nothing = tokio::time::timeout(Duration::from_millis(50), outbox.next_event()).await;
    assert!(nothing.is_err());
}

#[tokio::test]
async fn test_oversized_output_travels_as_attachment() {
    let (_memory, store) = memory_store();
    let worker = publisher(&store).await;
    let mut outbox = subscriber(&store, Subscription::Output).await;

    let content = json!({ "text": "y".repeat(5000) });
    worker
        .publish_output("abc", "stream", &content)
        .await
        .unwrap();

    match next(&mut outbox).await {
        BusEvent::Message { side, data, .. } => {
            assert_eq!(side, Side::Output);
            assert!(data.attachment_id().is_some());
            let decoded: Value = data.decode().await.unwrap();
            assert_eq!(decoded, content);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_malformed_payloads_are_dropped() {
    let (_memory, store) = memory_store();
    let frontend = publisher(&store).await;
    let mut inbox = subscriber(&store, Subscription::Input).await;
    let mut destroyed = subscriber(&store, Subscription::DestroyByWorker).await;
    let names = frontend.names().clone();

    raw(&store, Command::publish(names.input("abc"), "not json")).await;
    raw(
        &store,
        Command::publish(names.input("abc"), r#"{"name":"x","data":1,"attachment":"a"}"#),
    )
    .await;
    raw(&store, Command::publish(names.destroy_by_worker(), "{}")).await;
    frontend
        .publish_input("abc", "after", &json!(1))
        .await
        .unwrap();
    frontend.teardown_by_worker("abc", "done").await.unwrap();

    match next(&mut inbox).await {
        BusEvent::Message { name, .. } => assert_eq!(name, "after"),
        other => panic!("unexpected event {other:?}"),
    }
    match next(&mut destroyed).await {
        BusEvent::DestroyByWorker(notice) => assert_eq!(notice.message, "done"),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_reboot_request_and_reply() {
    let (_memory, store) = memory_store();
    let node = publisher(&store).await;
    let mut reboots = subscriber(&store, Subscription::RebootRequests).await;

    node.request_reboot("r-1", json!(5)).await.unwrap();
    node.reply_to_reboot_request("r-1", json!("ok"))
        .await
        .unwrap();

    let request = match next(&mut reboots).await {
        BusEvent::RebootRequest(message) => message,
        other => panic!("unexpected event {other:?}"),
    };
    assert_eq!(
        request,
        RebootMessage {
            id: "r-1".to_string(),
            is_request: true,
            token: "worker-1".to_string(),
            priority: Some(json!(5)),
            response: None,
        }
    );

    let reply = match next(&mut reboots).await {
        BusEvent::RebootRequest(message) => message,
        other => panic!("unexpected event {other:?}"),
    };
    assert!(!reply.is_request);
    assert_eq!(reply.id, request.id);
    assert_eq!(reply.response, Some(json!("ok")));
}

#[test]
fn test_reboot_wire_shape() {
    let message = RebootMessage {
        id: "r".to_string(),
        is_request: false,
        token: "t".to_string(),
        priority: None,
        response: Some(json!({ "ok": true })),
    };
    let wire: Value = serde_json::to_value(&message).unwrap();
    assert_eq!(
        wire,
        json!({ "id": "r", "isRequest": false, "token": "t", "response": { "ok": true } })
    );
}

#[tokio::test]
async fn test_subscribed_bus_rejects_commands() {
    let (_memory, store) = memory_store();
    let bus = Bus::connect(store.clone(), settings()).await.unwrap();
    assert!(bus.publisher().is_ok());
    assert_eq!(bus.mode(), None);

    let mut bus = bus.subscribe(Subscription::DestroyByUser).await.unwrap();
    assert_eq!(bus.mode(), Some(SubscriptionMode::Exact));
    assert!(bus.subscriber_mut().is_some());

    let err = bus.publisher().unwrap_err();
    assert!(matches!(err, BusError::Subscribed));
    assert!(err.is_precondition());
    assert!(matches!(bus.publisher_mut(), Err(BusError::Subscribed)));

    let (mut bus, err) = bus.subscribe(Subscription::Input).await.unwrap_err();
    assert!(matches!(
        err,
        BusError::AlreadySubscribed {
            mode: SubscriptionMode::Exact
        }
    ));
    assert_eq!(bus.mode(), Some(SubscriptionMode::Exact));

    // The original subscription is still live.
    let frontend = publisher(&store).await;
    frontend.teardown_by_user("abc", "closed").await.unwrap();
    let subscriber = bus.subscriber_mut().unwrap();
    match next(subscriber).await {
        BusEvent::DestroyByUser(notice) => assert_eq!(notice.sess_code, "abc"),
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn test_subscription_modes() {
    assert_eq!(Subscription::Input.mode(), SubscriptionMode::Pattern);
    assert_eq!(Subscription::Output.mode(), SubscriptionMode::Pattern);
    assert_eq!(Subscription::DestroyByWorker.mode(), SubscriptionMode::Exact);
    assert_eq!(Subscription::RebootRequests.mode(), SubscriptionMode::Exact);
    assert_eq!(Subscription::Expired.mode(), SubscriptionMode::Expiry);
    assert_eq!(SubscriptionMode::Expiry.to_string(), "expiry");
}

#[tokio::test]
async fn test_codec_inline_round_trip() {
    let (_memory, store) = memory_store();
    let bus = publisher(&store).await;
    let codec = bus.codec();

    for content in [json!(null), json!(42), json!("text"), json!({ "a": [1, 2] })] {
        let envelope = codec.serialize("update", &content).unwrap();
        assert_eq!(envelope.body, Body::Data(content.clone()));

        let wire = serde_json::to_string(&envelope).unwrap();
        let decoded: Envelope = serde_json::from_str(&wire).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(codec.deserialize(&decoded).resolve().await.unwrap(), content);
    }
}

#[tokio::test]
async fn test_codec_attachment_scenario() {
    let (_memory, store) = memory_store();
    let bus = publisher(&store).await;
    let codec = bus.codec();

    let content = json!({ "huge": "h".repeat(100_000) });
    let envelope = codec.serialize("update", &content).unwrap();
    assert_eq!(envelope.name, "update");
    let Body::Attachment(id) = &envelope.body else {
        panic!("expected attachment, got {:?}", envelope.body);
    };

    let wire: Value = serde_json::to_value(&envelope).unwrap();
    assert_eq!(wire, json!({ "name": "update", "attachment": id }));

    let fetched = codec.attachments().get(id).await.unwrap();
    assert_eq!(fetched, serde_json::to_string(&content).unwrap());

    // Reads leave the attachment in place until it expires.
    let resolved = codec.deserialize(&envelope).resolve().await.unwrap();
    assert_eq!(resolved, content);
}

#[tokio::test]
async fn test_codec_rejects_long_names() {
    let (_memory, store) = memory_store();
    let bus = publisher(&store).await;
    let name = "n".repeat(1025);

    for content in [json!(1), json!("z".repeat(10_000))] {
        let err = bus.codec().serialize(&name, &content).unwrap_err();
        assert!(matches!(err, BusError::NameTooLong { len: 1025, max: 1024 }));
    }
    assert!(bus.publish_input("abc", &name, &json!(1)).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_attachment_get_unknown_id_returns_null_sentinel() {
    let (_memory, store) = memory_store();
    let bus = publisher(&store).await;

    let started = tokio::time::Instant::now();
    let fetched = bus.codec().attachments().get("never-put").await.unwrap();
    assert_eq!(fetched, NULL_CONTENT);
    assert!(started.elapsed() >= Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn test_attachment_expires_regardless_of_reads() {
    let (memory, store) = memory_store();
    let bus = publisher(&store).await;
    let attachments = bus.codec().attachments();

    attachments.put("a1", "\"payload\"").await.unwrap();
    assert_eq!(attachments.get("a1").await.unwrap(), "\"payload\"");

    tokio::time::advance(Duration::from_secs(61)).await;
    memory.purge_expired();
    assert_eq!(
        raw(
            &store,
            Command::LLen {
                key: bus.names().attachment("a1")
            }
        )
        .await,
        Reply::Int(0)
    );
}

#[test]
fn test_envelope_wire_requires_exactly_one_body() {
    let neither = serde_json::from_str::<Envelope>(r#"{"name":"x"}"#).unwrap_err();
    assert!(neither.to_string().contains("invalid envelope: neither"));
    let both = serde_json::from_str::<Envelope>(r#"{"name":"x","data":1,"attachment":"a"}"#)
        .unwrap_err();
    assert!(both.to_string().contains("invalid envelope: both"));

    let null: Envelope = serde_json::from_str(r#"{"name":"x","data":null}"#).unwrap();
    assert_eq!(null.body, Body::Data(Value::Null));

    let attached: Envelope = serde_json::from_str(r#"{"name":"x","attachment":"id"}"#).unwrap();
    assert_eq!(attached.body, Body::Attachment("id".to_string()));
}

#[tokio::test]
async fn test_expiry_beyond_clock_range_never_expires() {
    let (memory, store) = memory_store();
    let huge = BusSettings {
        expiry_secs: u64::MAX,
        ..settings()
    };
    let frontend = Publisher::connect(store.clone(), huge.clone()).await.unwrap();
    let mut worker = Publisher::connect(store.clone(), huge).await.unwrap();
    worker.enable_claims().await.unwrap();

    frontend.enqueue("abc", "c", 1).await.unwrap();
    assert!(worker.claim().await.unwrap().is_some());
    worker.set_live("abc").await.unwrap();
    frontend.touch_input("abc").await.unwrap();
    worker.touch_output("abc").await.unwrap();

    let names = frontend.names();
    for key in [names.session("abc"), names.input("abc"), names.output("abc")] {
        assert_eq!(raw(&store, Command::Ttl { key }).await, Reply::Int(-1));
    }
    assert_eq!(memory.purge_expired(), 0);
    assert!(frontend.is_valid("abc").await.unwrap());
}

#[tokio::test]
async fn test_teardown_by_worker_before_claim_is_never_claimed() {
    let (_memory, store) = memory_store();
    let frontend = publisher(&store).await;
    let worker = worker(&store).await;

    frontend.enqueue("doomed", "d", 1).await.unwrap();
    frontend.enqueue("next", "n", 2).await.unwrap();
    worker.teardown_by_worker("doomed", "cancelled").await.unwrap();

    let claim = worker.claim().await.unwrap().unwrap();
    assert_eq!(claim.session, "next");
    assert_eq!(worker.claim().await.unwrap(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_teardown_racing_claims_never_hands_out_a_dead_session() {
    let (_memory, store) = memory_store();
    let frontend = publisher(&store).await;
    for i in 0..30 {
        frontend
            .enqueue(&format!("s{i}"), &format!("content-{i}"), i)
            .await
            .unwrap();
    }

    let teardown = {
        let store = store.clone();
        tokio::spawn(async move {
            let worker = publisher(&store).await;
            for i in (0..30).step_by(2) {
                worker
                    .teardown_by_worker(&format!("s{i}"), "cancelled")
                    .await
                    .unwrap();
                tokio::task::yield_now().await;
            }
        })
    };
    let mut claimers = Vec::new();
    for _ in 0..3 {
        let store = store.clone();
        claimers.push(tokio::spawn(async move {
            let worker = worker(&store).await;
            let mut mine = Vec::new();
            while let Some(claim) = worker.claim().await.unwrap() {
                mine.push(claim);
                tokio::task::yield_now().await;
            }
            mine
        }));
    }

    teardown.await.unwrap();
    let mut claimed = Vec::new();
    for claimer in claimers {
        claimed.extend(claimer.await.unwrap());
    }

    // Whatever was claimed still had its record at claim time.
    for claim in &claimed {
        let i = claim.session.trim_start_matches('s');
        assert_eq!(claim.content, format!("content-{i}"));
    }
    let mut sessions: Vec<String> = claimed.into_iter().map(|c| c.session).collect();
    sessions.sort();
    let before = sessions.len();
    sessions.dedup();
    assert_eq!(sessions.len(), before, "a session was claimed twice");
    for i in (1..30).step_by(2) {
        assert!(sessions.contains(&format!("s{i}")), "s{i} was never claimed");
    }
    assert_eq!(frontend.pending_len().await.unwrap(), 0);
}

/// Redis-backed tests run only when `TEST_REDIS_URL` points at a server.
fn redis_store() -> Option<Arc<dyn Store>> {
    let url = std::env::var("TEST_REDIS_URL").ok()?;
    Some(Arc::new(RedisStore::open(&url).unwrap()))
}

/// A namespace of its own, so runs never see each other's keys.
fn isolated_settings() -> BusSettings {
    BusSettings {
        namespace: format!("test-{}", uuid::Uuid::new_v4()),
        ..settings()
    }
}

#[tokio::test]
async fn test_redis_claim_runs_the_lua_script() {
    let Some(store) = redis_store() else {
        return;
    };
    let settings = isolated_settings();
    let frontend = Publisher::connect(store.clone(), settings.clone())
        .await
        .unwrap();
    let mut worker = Publisher::connect(store.clone(), settings).await.unwrap();
    worker.enable_claims().await.unwrap();

    frontend.enqueue("a", "content-a", 100).await.unwrap();
    frontend.enqueue("b", "content-b", 200).await.unwrap();
    frontend.enqueue("orphan", "gone", 50).await.unwrap();
    assert_eq!(
        frontend.pending().await.unwrap(),
        vec![
            ("orphan".to_string(), 50),
            ("a".to_string(), 100),
            ("b".to_string(), 200)
        ]
    );
    frontend.teardown_by_user("orphan", "tab closed").await.unwrap();

    let first = worker.claim().await.unwrap().unwrap();
    assert_eq!(
        first,
        Claim {
            session: "a".to_string(),
            content: "content-a".to_string(),
        }
    );
    let names = frontend.names();
    assert_eq!(
        raw(&store, Command::hget(names.session("a"), "token")).await,
        Reply::Bulk("worker-1".to_string())
    );
    let ttl = raw(&store, Command::Ttl { key: names.output("a") }).await;
    assert!(matches!(ttl, Reply::Int(1..=60)), "{ttl:?}");

    assert_eq!(worker.claim().await.unwrap().unwrap().session, "b");
    assert_eq!(worker.claim().await.unwrap(), None);

    for code in ["a", "b"] {
        worker.teardown_by_worker(code, "done").await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_redis_claimers_on_separate_connections_partition_the_queue() {
    let Some(store) = redis_store() else {
        return;
    };
    let settings = isolated_settings();
    let frontend = Publisher::connect(store.clone(), settings.clone())
        .await
        .unwrap();
    for i in 0..40 {
        frontend.enqueue(&format!("s{i}"), "c", i).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..4 {
        let store = store.clone();
        let settings = settings.clone();
        handles.push(tokio::spawn(async move {
            let mut worker = Publisher::connect(store, settings).await.unwrap();
            worker.enable_claims().await.unwrap();
            let mut mine = Vec::new();
            while let Some(claim) = worker.claim().await.unwrap() {
                mine.push(claim.session);
            }
            mine
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    assert_eq!(all.len(), 40);
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 40);

    for code in &all {
        frontend.teardown_by_worker(code, "done").await.unwrap();
    }
}

#[tokio::test]
async fn test_redis_teardown_by_worker_then_claim() {
    let Some(store) = redis_store() else {
        return;
    };
    let settings = isolated_settings();
    let frontend = Publisher::connect(store.clone(), settings.clone())
        .await
        .unwrap();
    let mut worker = Publisher::connect(store.clone(), settings).await.unwrap();
    worker.enable_claims().await.unwrap();

    frontend.enqueue("doomed", "d", 1).await.unwrap();
    frontend.enqueue("next", "n", 2).await.unwrap();
    worker.teardown_by_worker("doomed", "cancelled").await.unwrap();

    assert_eq!(worker.claim().await.unwrap().unwrap().session, "next");
    assert_eq!(worker.claim().await.unwrap(), None);
    worker.teardown_by_worker("next", "done").await.unwrap();
}

#[tokio::test]
async fn test_redis_output_with_attachment_reaches_subscriber() {
    let Some(store) = redis_store() else {
        return;
    };
    let settings = isolated_settings();
    let mut outputs = Publisher::connect(store.clone(), settings.clone())
        .await
        .unwrap()
        .subscribe(Subscription::Output)
        .await
        .unwrap();
    let worker = Publisher::connect(store.clone(), settings).await.unwrap();

    let content = json!({ "text": "y".repeat(5000) });
    worker.publish_output("abc", "stream", &content).await.unwrap();

    match next(&mut outputs).await {
        BusEvent::Message {
            side,
            session,
            name,
            data,
        } => {
            assert_eq!(side, Side::Output);
            assert_eq!(session, "abc");
            assert_eq!(name, "stream");
            assert!(data.attachment_id().is_some());
            assert_eq!(data.resolve().await.unwrap(), content);
        }
        other => panic!("unexpected event {other:?}"),
    }
}
