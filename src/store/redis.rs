//! Redis backend.
//!
//! Every bus process connects to the same server, which is what lets front
//! ends and workers in different processes share one queue. Transactions are
//! `MULTI`/`EXEC` pipelines and scripts run their `lua` body server-side.
//!
//! Unlike `MemoryStore`, a command failing inside a transaction fails the
//! whole `exec` call instead of yielding a `Reply::Error` entry. Expiration
//! notifications need `notify-keyspace-events` to include `Ex`; subscribing
//! to `Expirations` turns the flags on when the server allows `CONFIG SET`.

use std::collections::HashMap;
use std::time::Duration;

use futures::future::BoxFuture;
use futures_util::StreamExt;
use redis::aio;
use redis::{Cmd, ErrorKind, Msg, RedisError, Value};
use tracing::{debug, warn};

use super::{
    Command, Connection, Notification, NotificationStream, Reply, Script, ScriptHandle, Store,
    SubscribeTarget,
};
use crate::utils::StoreError;

/// Expiration events from every database.
const EXPIRED_PATTERN: &str = "__keyevent@*__:expired";

const KEYSPACE_EVENTS: &str = "notify-keyspace-events";

#[derive(Debug, Clone)]
pub struct RedisStore {
    client: redis::Client,
}

impl RedisStore {
    /// `url` is a `redis://` connection string. No connection is made until
    /// `connect` is called.
    pub fn open(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(store_error)?;
        Ok(Self { client })
    }
}

impl Store for RedisStore {
    fn connect(&self) -> BoxFuture<'_, Result<Box<dyn Connection>, StoreError>> {
        Box::pin(async move {
            let conn = self
                .client
                .get_async_connection()
                .await
                .map_err(store_error)?;
            Ok(Box::new(RedisConnection {
                conn,
                scripts: HashMap::new(),
            }) as Box<dyn Connection>)
        })
    }
}

struct RedisConnection {
    conn: aio::Connection,
    scripts: HashMap<String, redis::Script>,
}

impl Connection for RedisConnection {
    fn query(&mut self, command: Command) -> BoxFuture<'_, Result<Reply, StoreError>> {
        Box::pin(async move {
            let value: Value = to_cmd(&command)
                .query_async(&mut self.conn)
                .await
                .map_err(store_error)?;
            Ok(to_reply(&command, value))
        })
    }

    fn exec(&mut self, commands: Vec<Command>) -> BoxFuture<'_, Result<Vec<Reply>, StoreError>> {
        Box::pin(async move {
            if commands.is_empty() {
                return Ok(Vec::new());
            }
            let mut pipe = redis::pipe();
            pipe.atomic();
            for command in &commands {
                pipe.add_command(to_cmd(command));
            }
            let values: Vec<Value> = pipe
                .query_async(&mut self.conn)
                .await
                .map_err(store_error)?;
            if values.len() != commands.len() {
                return Err(StoreError::Rejected(format!(
                    "transaction returned {} replies for {} commands",
                    values.len(),
                    commands.len()
                )));
            }
            Ok(commands
                .iter()
                .zip(values)
                .map(|(command, value)| to_reply(command, value))
                .collect())
        })
    }

    fn load_script(&mut self, script: &Script) -> BoxFuture<'_, Result<ScriptHandle, StoreError>> {
        let name = script.name.to_string();
        let lua = script.lua;
        Box::pin(async move {
            let sha: String = redis::cmd("SCRIPT")
                .arg("LOAD")
                .arg(lua)
                .query_async(&mut self.conn)
                .await
                .map_err(store_error)?;
            debug!(script = %name, %sha, "script loaded");
            self.scripts.insert(name.clone(), redis::Script::new(lua));
            Ok(ScriptHandle(name))
        })
    }

    fn eval(
        &mut self,
        script: &ScriptHandle,
        keys: Vec<String>,
        args: Vec<String>,
    ) -> BoxFuture<'_, Result<Reply, StoreError>> {
        let name = script.0.clone();
        Box::pin(async move {
            let Some(script) = self.scripts.get(&name) else {
                return Err(StoreError::NoScript(name));
            };
            let mut invocation = script.prepare_invoke();
            for key in &keys {
                invocation.key(key);
            }
            for arg in &args {
                invocation.arg(arg);
            }
            // EVALSHA, reloading the body if the server has flushed its cache.
            let value: Value = invocation
                .invoke_async(&mut self.conn)
                .await
                .map_err(store_error)?;
            Ok(from_value(value))
        })
    }

    fn brpoplpush(
        &mut self,
        source: &str,
        destination: &str,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<Option<String>, StoreError>> {
        let mut cmd = if timeout.is_zero() {
            redis::cmd("RPOPLPUSH")
        } else {
            redis::cmd("BRPOPLPUSH")
        };
        cmd.arg(source).arg(destination);
        if !timeout.is_zero() {
            // Whole seconds; a zero timeout would block forever.
            cmd.arg(timeout.as_secs().max(1));
        }
        Box::pin(async move {
            let popped: Option<String> = cmd
                .query_async(&mut self.conn)
                .await
                .map_err(store_error)?;
            Ok(popped)
        })
    }

    fn subscribe(
        self: Box<Self>,
        target: SubscribeTarget,
    ) -> BoxFuture<'static, Result<NotificationStream, StoreError>> {
        let RedisConnection { mut conn, .. } = *self;
        Box::pin(async move {
            if target == SubscribeTarget::Expirations {
                enable_expiry_events(&mut conn).await;
            }

            let mut pubsub = conn.into_pubsub();
            match &target {
                SubscribeTarget::Channels(channels) => {
                    for channel in channels {
                        pubsub.subscribe(channel).await.map_err(store_error)?;
                    }
                }
                SubscribeTarget::Patterns(patterns) => {
                    for pattern in patterns {
                        pubsub.psubscribe(pattern).await.map_err(store_error)?;
                    }
                }
                SubscribeTarget::Expirations => {
                    pubsub
                        .psubscribe(EXPIRED_PATTERN)
                        .await
                        .map_err(store_error)?;
                }
            }

            let stream = pubsub
                .into_on_message()
                .filter_map(|msg| async move { notification(&msg) });
            Ok(stream.boxed())
        })
    }
}

fn notification(msg: &Msg) -> Option<Notification> {
    let channel = msg.get_channel_name().to_string();
    let payload: String = match msg.get_payload() {
        Ok(payload) => payload,
        Err(e) => {
            warn!(%channel, error = %e, "undecodable notification dropped");
            return None;
        }
    };
    let pattern = if msg.from_pattern() {
        msg.get_pattern().ok()
    } else {
        None
    };
    Some(Notification {
        channel,
        pattern,
        payload,
    })
}

/// Whether `flags` already deliver expired-key events.
pub(super) fn has_expiry_events(flags: &str) -> bool {
    flags.contains('E') && (flags.contains('x') || flags.contains('A'))
}

async fn enable_expiry_events(conn: &mut aio::Connection) {
    let current: Result<Vec<String>, RedisError> = redis::cmd("CONFIG")
        .arg("GET")
        .arg(KEYSPACE_EVENTS)
        .query_async(conn)
        .await;
    let flags = match current {
        Ok(pair) => pair.into_iter().nth(1).unwrap_or_default(),
        Err(e) => {
            warn!(error = %e, "cannot read keyspace event settings, expirations may be missed");
            return;
        }
    };
    if has_expiry_events(&flags) {
        return;
    }

    let wanted = format!("{flags}Ex");
    match redis::cmd("CONFIG")
        .arg("SET")
        .arg(KEYSPACE_EVENTS)
        .arg(&wanted)
        .query_async::<_, ()>(conn)
        .await
    {
        Ok(()) => debug!(flags = %wanted, "keyspace expiry events enabled"),
        Err(e) => warn!(error = %e, "cannot enable keyspace expiry events"),
    }
}

fn to_cmd(command: &Command) -> Cmd {
    match command {
        Command::Set { key, value } => redis::cmd("SET").arg(key).arg(value).clone(),
        Command::Get { key } => redis::cmd("GET").arg(key).clone(),
        Command::Del { keys } => redis::cmd("DEL").arg(keys).clone(),
        Command::Expire { key, seconds } => redis::cmd("EXPIRE").arg(key).arg(*seconds).clone(),
        Command::Ttl { key } => redis::cmd("TTL").arg(key).clone(),
        Command::HSet { key, fields } => {
            let mut cmd = redis::cmd("HSET");
            cmd.arg(key);
            for (field, value) in fields {
                cmd.arg(field).arg(value);
            }
            cmd
        }
        Command::HGet { key, field } => redis::cmd("HGET").arg(key).arg(field).clone(),
        Command::RPush { key, value } => redis::cmd("RPUSH").arg(key).arg(value).clone(),
        Command::LLen { key } => redis::cmd("LLEN").arg(key).clone(),
        Command::ZAdd { key, score, member } => {
            redis::cmd("ZADD").arg(key).arg(*score).arg(member).clone()
        }
        Command::ZRem { key, member } => redis::cmd("ZREM").arg(key).arg(member).clone(),
        Command::ZCard { key } => redis::cmd("ZCARD").arg(key).clone(),
        Command::ZRange {
            key,
            start,
            stop,
            with_scores,
        } => {
            let mut cmd = redis::cmd("ZRANGE");
            cmd.arg(key).arg(*start).arg(*stop);
            if *with_scores {
                cmd.arg("WITHSCORES");
            }
            cmd
        }
        Command::Publish { channel, payload } => {
            redis::cmd("PUBLISH").arg(channel).arg(payload).clone()
        }
    }
}

/// Converts a raw reply, normalising `WITHSCORES` scores to integers.
fn to_reply(command: &Command, value: Value) -> Reply {
    let reply = from_value(value);
    match (command, reply) {
        (
            Command::ZRange {
                with_scores: true, ..
            },
            Reply::Array(items),
        ) => Reply::Array(
            items
                .into_iter()
                .enumerate()
                .map(|(i, item)| if i % 2 == 1 { score(item) } else { item })
                .collect(),
        ),
        (_, reply) => reply,
    }
}

pub(super) fn score(item: Reply) -> Reply {
    match item {
        Reply::Bulk(text) => match text.parse::<f64>() {
            Ok(score) => Reply::Int(score as i64),
            Err(_) => Reply::Bulk(text),
        },
        other => other,
    }
}

pub(super) fn from_value(value: Value) -> Reply {
    match value {
        Value::Nil => Reply::Nil,
        Value::Okay => Reply::Ok,
        Value::Int(n) => Reply::Int(n),
        Value::Data(bytes) => Reply::Bulk(String::from_utf8_lossy(&bytes).into_owned()),
        Value::Status(status) => Reply::Bulk(status),
        Value::Bulk(items) => Reply::Array(items.into_iter().map(from_value).collect()),
    }
}

fn store_error(e: RedisError) -> StoreError {
    if e.is_connection_dropped() {
        return StoreError::Closed;
    }
    if e.is_io_error() || e.is_connection_refusal() || e.is_timeout() {
        return StoreError::Connection(e.to_string());
    }
    match (e.kind(), e.code()) {
        (ErrorKind::NoScriptError, _) => StoreError::NoScript(e.to_string()),
        (_, Some("WRONGTYPE")) => StoreError::WrongType(e.detail().unwrap_or_default().to_string()),
        _ => StoreError::Rejected(e.to_string()),
    }
}
