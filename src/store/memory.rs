//! In-process store backend.
//!
//! The keyspace lives behind one lock, so every transaction and script runs
//! atomically with respect to all connections. Keys carry an optional
//! deadline on the tokio clock; expired keys are removed lazily when touched
//! and eagerly by `purge_expired` (or the reaper task), and every removal by
//! expiry is announced on `EXPIRED_FEED`.
//!
//! Sorted-set members with equal scores are ordered by insertion.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use futures_util::StreamExt;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{
    Command, Connection, EXPIRED_FEED, NativeScript, Notification, NotificationStream, Reply,
    Script, ScriptContext, ScriptHandle, Store, SubscribeTarget, glob_match,
};
use crate::utils::StoreError;

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    keyspace: Mutex<Keyspace>,
    scripts: Mutex<HashMap<String, NativeScript>>,
    events: broadcast::Sender<Published>,
    pushed: Notify,
}

#[derive(Debug, Clone)]
struct Published {
    channel: String,
    payload: String,
}

#[derive(Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
    next_seq: u64,
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

enum Value {
    Str(String),
    List(VecDeque<String>),
    Hash(HashMap<String, String>),
    Sorted(SortedSet),
}

#[derive(Default)]
struct SortedSet {
    ranked: BTreeMap<(i64, u64), String>,
    members: HashMap<String, (i64, u64)>,
}

/// Side effects collected while the keyspace lock is held and released
/// once it is dropped.
struct Effects {
    published: Vec<Published>,
    pushed: bool,
    subscribers: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// `capacity` bounds how many notifications a slow subscriber may fall
    /// behind before it starts missing them.
    pub fn with_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(Inner {
                keyspace: Mutex::new(Keyspace::default()),
                scripts: Mutex::new(HashMap::new()),
                events,
                pushed: Notify::new(),
            }),
        }
    }

    /// Remove every key whose deadline has passed, announcing each one.
    pub fn purge_expired(&self) -> usize {
        self.inner.purge_expired()
    }

    /// Spawn a task that calls `purge_expired` every `period`. The task ends
    /// once the last handle to the store is dropped.
    pub fn spawn_reaper(&self, period: Duration) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let purged = inner.purge_expired();
                if purged > 0 {
                    debug!(purged, "expired keys removed");
                }
            }
        })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("subscribers", &self.inner.events.receiver_count())
            .finish()
    }
}

impl Store for MemoryStore {
    fn connect(&self) -> BoxFuture<'_, Result<Box<dyn Connection>, StoreError>> {
        let inner = self.inner.clone();
        Box::pin(async move { Ok(Box::new(MemoryConnection { inner }) as Box<dyn Connection>) })
    }
}

impl Inner {
    fn keyspace(&self) -> MutexGuard<'_, Keyspace> {
        self.keyspace.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn effects(&self) -> Effects {
        Effects {
            published: Vec::new(),
            pushed: false,
            subscribers: self.events.receiver_count(),
        }
    }

    fn dispatch(&self, fx: Effects) {
        for published in fx.published {
            // No receivers is not an error for pub/sub.
            let _ = self.events.send(published);
        }
        if fx.pushed {
            self.pushed.notify_waiters();
        }
    }

    fn purge_expired(&self) -> usize {
        let mut fx = self.effects();
        let purged = self.keyspace().purge_expired(Instant::now(), &mut fx);
        self.dispatch(fx);
        purged
    }

    fn run<T>(&self, f: impl FnOnce(&mut Keyspace, Instant, &mut Effects) -> T) -> T {
        let mut fx = self.effects();
        let out = {
            let mut keyspace = self.keyspace();
            f(&mut *keyspace, Instant::now(), &mut fx)
        };
        self.dispatch(fx);
        out
    }
}

struct MemoryConnection {
    inner: Arc<Inner>,
}

impl Connection for MemoryConnection {
    fn query(&mut self, command: Command) -> BoxFuture<'_, Result<Reply, StoreError>> {
        let reply = self
            .inner
            .run(|keyspace, now, fx| keyspace.apply(command, now, fx));
        Box::pin(async move { reply })
    }

    fn exec(&mut self, commands: Vec<Command>) -> BoxFuture<'_, Result<Vec<Reply>, StoreError>> {
        let replies: Vec<Reply> = self.inner.run(|keyspace, now, fx| {
            commands
                .into_iter()
                .map(|command| {
                    keyspace
                        .apply(command, now, fx)
                        .unwrap_or_else(|e| Reply::Error(e.to_string()))
                })
                .collect()
        });
        Box::pin(async move { Ok(replies) })
    }

    fn load_script(&mut self, script: &Script) -> BoxFuture<'_, Result<ScriptHandle, StoreError>> {
        self.inner
            .scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(script.name.to_string(), script.native);
        let handle = ScriptHandle(script.name.to_string());
        Box::pin(async move { Ok(handle) })
    }

    fn eval(
        &mut self,
        script: &ScriptHandle,
        keys: Vec<String>,
        args: Vec<String>,
    ) -> BoxFuture<'_, Result<Reply, StoreError>> {
        let native = self
            .inner
            .scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&script.0)
            .copied();
        let result = match native {
            Some(native) => self.inner.run(|keyspace, now, fx| {
                let mut ctx = Context { keyspace, now, fx };
                native(&mut ctx, &keys, &args)
            }),
            None => Err(StoreError::NoScript(script.0.clone())),
        };
        Box::pin(async move { result })
    }

    fn brpoplpush(
        &mut self,
        source: &str,
        destination: &str,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<Option<String>, StoreError>> {
        let source = source.to_string();
        let destination = destination.to_string();
        Box::pin(async move {
            let deadline = Instant::now().checked_add(timeout);
            loop {
                let notified = self.inner.pushed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let popped = self
                    .inner
                    .run(|keyspace, now, fx| keyspace.rpoplpush(&source, &destination, now, fx))?;
                if popped.is_some() {
                    return Ok(popped);
                }
                match deadline {
                    Some(deadline) => {
                        if tokio::time::timeout_at(deadline, notified).await.is_err() {
                            return Ok(None);
                        }
                    }
                    None => notified.await,
                }
            }
        })
    }

    fn subscribe(
        self: Box<Self>,
        target: SubscribeTarget,
    ) -> BoxFuture<'static, Result<NotificationStream, StoreError>> {
        let receiver = self.inner.events.subscribe();
        let inner = self.inner;
        Box::pin(async move {
            let stream = futures::stream::unfold(
                (receiver, target, inner),
                |(mut receiver, target, inner)| async move {
                    loop {
                        match receiver.recv().await {
                            Ok(published) => {
                                if let Some(notification) = deliver(&target, published) {
                                    return Some((notification, (receiver, target, inner)));
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(skipped, "subscriber fell behind, notifications dropped");
                            }
                            Err(broadcast::error::RecvError::Closed) => return None,
                        }
                    }
                },
            );
            Ok(stream.boxed())
        })
    }
}

fn deliver(target: &SubscribeTarget, published: Published) -> Option<Notification> {
    match target {
        SubscribeTarget::Channels(channels) => channels
            .iter()
            .any(|c| *c == published.channel)
            .then(|| Notification {
                channel: published.channel,
                pattern: None,
                payload: published.payload,
            }),
        SubscribeTarget::Patterns(patterns) => patterns
            .iter()
            .find(|p| glob_match(p, &published.channel))
            .map(|pattern| Notification {
                pattern: Some(pattern.clone()),
                channel: published.channel,
                payload: published.payload,
            }),
        SubscribeTarget::Expirations => (published.channel == EXPIRED_FEED).then(|| Notification {
            channel: published.channel,
            pattern: None,
            payload: published.payload,
        }),
    }
}

struct Context<'a> {
    keyspace: &'a mut Keyspace,
    now: Instant,
    fx: &'a mut Effects,
}

impl ScriptContext for Context<'_> {
    fn call(&mut self, command: Command) -> Result<Reply, StoreError> {
        self.keyspace.apply(command, self.now, self.fx)
    }
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::WrongType(key.to_string())
}

impl Keyspace {
    fn purge_expired(&mut self, now: Instant, fx: &mut Effects) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.entries.remove(key);
            fx.expired(key);
        }
        expired.len()
    }

    fn entry(&mut self, key: &str, now: Instant, fx: &mut Effects) -> Option<&mut Entry> {
        if self.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            self.entries.remove(key);
            fx.expired(key);
        }
        self.entries.get_mut(key)
    }

    fn entry_or_insert(
        &mut self,
        key: &str,
        now: Instant,
        fx: &mut Effects,
        empty: fn() -> Value,
    ) -> &mut Entry {
        // Drops the key first if it has expired.
        self.entry(key, now, fx);
        self.entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(empty()))
    }

    fn list_mut(
        &mut self,
        key: &str,
        now: Instant,
        fx: &mut Effects,
    ) -> Result<&mut VecDeque<String>, StoreError> {
        match &mut self
            .entry_or_insert(key, now, fx, || Value::List(VecDeque::new()))
            .value
        {
            Value::List(list) => Ok(list),
            _ => Err(wrong_type(key)),
        }
    }

    fn hash_mut(
        &mut self,
        key: &str,
        now: Instant,
        fx: &mut Effects,
    ) -> Result<&mut HashMap<String, String>, StoreError> {
        match &mut self
            .entry_or_insert(key, now, fx, || Value::Hash(HashMap::new()))
            .value
        {
            Value::Hash(hash) => Ok(hash),
            _ => Err(wrong_type(key)),
        }
    }

    fn sorted_mut(
        &mut self,
        key: &str,
        now: Instant,
        fx: &mut Effects,
    ) -> Result<&mut SortedSet, StoreError> {
        match &mut self
            .entry_or_insert(key, now, fx, || Value::Sorted(SortedSet::default()))
            .value
        {
            Value::Sorted(set) => Ok(set),
            _ => Err(wrong_type(key)),
        }
    }

    /// Aggregates are removed once empty, which also drops their TTL.
    fn drop_if_empty(&mut self, key: &str) {
        let empty = match self.entries.get(key).map(|e| &e.value) {
            Some(Value::List(list)) => list.is_empty(),
            Some(Value::Hash(hash)) => hash.is_empty(),
            Some(Value::Sorted(set)) => set.members.is_empty(),
            _ => false,
        };
        if empty {
            self.entries.remove(key);
        }
    }

    fn rpoplpush(
        &mut self,
        source: &str,
        destination: &str,
        now: Instant,
        fx: &mut Effects,
    ) -> Result<Option<String>, StoreError> {
        if let Some(entry) = self.entry(destination, now, fx) {
            if !matches!(entry.value, Value::List(_)) {
                return Err(wrong_type(destination));
            }
        }
        let popped = match self.entry(source, now, fx) {
            None => return Ok(None),
            Some(entry) => match &mut entry.value {
                Value::List(list) => list.pop_back(),
                _ => return Err(wrong_type(source)),
            },
        };
        let Some(value) = popped else {
            return Ok(None);
        };
        self.list_mut(destination, now, fx)?.push_front(value.clone());
        self.drop_if_empty(source);
        fx.pushed = true;
        Ok(Some(value))
    }

    fn apply(&mut self, command: Command, now: Instant, fx: &mut Effects) -> Result<Reply, StoreError> {
        match command {
            Command::Set { key, value } => {
                self.entries.insert(key, Entry::new(Value::Str(value)));
                Ok(Reply::Ok)
            }
            Command::Get { key } => match self.entry(&key, now, fx) {
                None => Ok(Reply::Nil),
                Some(Entry {
                    value: Value::Str(value),
                    ..
                }) => Ok(Reply::Bulk(value.clone())),
                Some(_) => Err(wrong_type(&key)),
            },
            Command::Del { keys } => {
                let mut removed = 0;
                for key in keys {
                    if self.entry(&key, now, fx).is_some() {
                        self.entries.remove(&key);
                        removed += 1;
                    }
                }
                Ok(Reply::Int(removed))
            }
            Command::Expire { key, seconds } => match self.entry(&key, now, fx) {
                None => Ok(Reply::Int(0)),
                Some(entry) => {
                    // Past the clock's range the key simply never expires.
                    entry.expires_at = now.checked_add(Duration::from_secs(seconds));
                    Ok(Reply::Int(1))
                }
            },
            Command::Ttl { key } => Ok(Reply::Int(match self.entry(&key, now, fx) {
                None => -2,
                Some(Entry {
                    expires_at: None, ..
                }) => -1,
                Some(Entry {
                    expires_at: Some(at),
                    ..
                }) => {
                    let remaining = at.saturating_duration_since(now).as_millis();
                    i64::try_from(remaining.div_ceil(1000)).unwrap_or(i64::MAX)
                }
            })),
            Command::HSet { key, fields } => {
                let hash = self.hash_mut(&key, now, fx)?;
                let mut added = 0;
                for (field, value) in fields {
                    if hash.insert(field, value).is_none() {
                        added += 1;
                    }
                }
                Ok(Reply::Int(added))
            }
            Command::HGet { key, field } => match self.entry(&key, now, fx) {
                None => Ok(Reply::Nil),
                Some(Entry {
                    value: Value::Hash(hash),
                    ..
                }) => Ok(hash.get(&field).cloned().map_or(Reply::Nil, Reply::Bulk)),
                Some(_) => Err(wrong_type(&key)),
            },
            Command::RPush { key, value } => {
                let list = self.list_mut(&key, now, fx)?;
                list.push_back(value);
                let len = list.len() as i64;
                fx.pushed = true;
                Ok(Reply::Int(len))
            }
            Command::LLen { key } => match self.entry(&key, now, fx) {
                None => Ok(Reply::Int(0)),
                Some(Entry {
                    value: Value::List(list),
                    ..
                }) => Ok(Reply::Int(list.len() as i64)),
                Some(_) => Err(wrong_type(&key)),
            },
            Command::ZAdd { key, score, member } => {
                let seq = self.next_seq;
                self.next_seq += 1;
                let added = self.sorted_mut(&key, now, fx)?.insert(score, member, seq);
                Ok(Reply::Int(i64::from(added)))
            }
            Command::ZRem { key, member } => {
                let removed = match self.entry(&key, now, fx) {
                    None => false,
                    Some(Entry {
                        value: Value::Sorted(set),
                        ..
                    }) => set.remove(&member),
                    Some(_) => return Err(wrong_type(&key)),
                };
                self.drop_if_empty(&key);
                Ok(Reply::Int(i64::from(removed)))
            }
            Command::ZCard { key } => match self.entry(&key, now, fx) {
                None => Ok(Reply::Int(0)),
                Some(Entry {
                    value: Value::Sorted(set),
                    ..
                }) => Ok(Reply::Int(set.members.len() as i64)),
                Some(_) => Err(wrong_type(&key)),
            },
            Command::ZRange {
                key,
                start,
                stop,
                with_scores,
            } => match self.entry(&key, now, fx) {
                None => Ok(Reply::Array(Vec::new())),
                Some(Entry {
                    value: Value::Sorted(set),
                    ..
                }) => Ok(Reply::Array(set.range(start, stop, with_scores))),
                Some(_) => Err(wrong_type(&key)),
            },
            Command::Publish { channel, payload } => {
                let subscribers = fx.subscribers as i64;
                fx.published.push(Published { channel, payload });
                Ok(Reply::Int(subscribers))
            }
        }
    }
}

impl SortedSet {
    /// Returns whether `member` is new. Updating an existing member's score
    /// keeps its original insertion rank among equal scores.
    fn insert(&mut self, score: i64, member: String, seq: u64) -> bool {
        match self.members.get(&member).copied() {
            Some((old_score, old_seq)) => {
                self.ranked.remove(&(old_score, old_seq));
                self.ranked.insert((score, old_seq), member.clone());
                self.members.insert(member, (score, old_seq));
                false
            }
            None => {
                self.ranked.insert((score, seq), member.clone());
                self.members.insert(member, (score, seq));
                true
            }
        }
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.members.remove(member) {
            Some(rank) => {
                self.ranked.remove(&rank);
                true
            }
            None => false,
        }
    }

    fn range(&self, start: i64, stop: i64, with_scores: bool) -> Vec<Reply> {
        let len = self.ranked.len() as i64;
        let start = if start < 0 { (len + start).max(0) } else { start };
        let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
        if start > stop || start >= len {
            return Vec::new();
        }

        let mut out = Vec::new();
        for ((score, _), member) in self
            .ranked
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
        {
            out.push(Reply::Bulk(member.clone()));
            if with_scores {
                out.push(Reply::Int(*score));
            }
        }
        out
    }
}

impl Effects {
    fn expired(&mut self, key: &str) {
        self.published.push(Published {
            channel: EXPIRED_FEED.to_string(),
            payload: key.to_string(),
        });
    }
}
