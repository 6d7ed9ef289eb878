//! The `store` module describes the shared key-value / pub-sub store the bus
//! runs on.
//!
//! A `Store` hands out connections. A `Connection` runs commands, either one
//! at a time or as an atomic transaction, evaluates registered scripts, and
//! can be turned into a subscription; once subscribed it can no longer issue
//! commands, which `subscribe` enforces by consuming the connection.
//!
//! `redis::RedisStore` talks to a Redis server shared by every process on
//! the bus. `memory::MemoryStore` is an in-process backend for a single
//! process and for tests.

pub mod memory;
pub mod redis;

use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::utils::StoreError;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Channel on which stores publish the names of keys removed by expiry.
pub const EXPIRED_FEED: &str = "__keyevent@0__:expired";

/// A single store command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Set { key: String, value: String },
    Get { key: String },
    Del { keys: Vec<String> },
    Expire { key: String, seconds: u64 },
    /// Remaining time to live in seconds; `-1` without expiry, `-2` if missing.
    Ttl { key: String },
    HSet { key: String, fields: Vec<(String, String)> },
    HGet { key: String, field: String },
    RPush { key: String, value: String },
    LLen { key: String },
    ZAdd { key: String, score: i64, member: String },
    ZRem { key: String, member: String },
    ZCard { key: String },
    /// Members by rank, inclusive, negative indexes count from the end.
    ZRange {
        key: String,
        start: i64,
        stop: i64,
        with_scores: bool,
    },
    Publish { channel: String, payload: String },
}

impl Command {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Command::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn expire(key: impl Into<String>, ttl: Duration) -> Self {
        Command::Expire {
            key: key.into(),
            seconds: ttl.as_secs(),
        }
    }

    pub fn hset<K, V>(key: impl Into<String>, fields: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Command::HSet {
            key: key.into(),
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn hget(key: impl Into<String>, field: impl Into<String>) -> Self {
        Command::HGet {
            key: key.into(),
            field: field.into(),
        }
    }

    pub fn publish(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Command::Publish {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

/// Reply to a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Nil,
    Ok,
    Int(i64),
    Bulk(String),
    Array(Vec<Reply>),
    /// A command inside a transaction failed; the others still ran.
    Error(String),
}

impl Reply {
    pub fn into_string(self) -> Option<String> {
        match self {
            Reply::Bulk(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Reply::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::Nil)
    }
}

/// Command access from inside an atomic script.
pub trait ScriptContext {
    fn call(&mut self, command: Command) -> Result<Reply, StoreError>;
}

pub type NativeScript = fn(&mut dyn ScriptContext, &[String], &[String]) -> Result<Reply, StoreError>;

/// An atomic server-side procedure.
///
/// Remote stores evaluate `lua`; embedded stores run `native` while holding
/// their keyspace lock. Both bodies implement the same algorithm.
#[derive(Debug, Clone, Copy)]
pub struct Script {
    pub name: &'static str,
    pub lua: &'static str,
    pub native: NativeScript,
}

/// Handle returned by `Connection::load_script`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScriptHandle(pub String);

/// What a subscribed connection listens to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeTarget {
    Channels(Vec<String>),
    Patterns(Vec<String>),
    /// The store's key-expiration feed; payloads are expired key names.
    Expirations,
}

/// A message delivered to a subscribed connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    /// Set when delivered through a pattern subscription.
    pub pattern: Option<String>,
    pub payload: String,
}

pub type NotificationStream = BoxStream<'static, Notification>;

pub trait Store: Send + Sync + std::fmt::Debug {
    fn connect(&self) -> BoxFuture<'_, Result<Box<dyn Connection>, StoreError>>;
}

pub trait Connection: Send {
    /// Run one command.
    fn query(&mut self, command: Command) -> BoxFuture<'_, Result<Reply, StoreError>>;

    /// Run `commands` atomically and in order, returning one reply each.
    fn exec(&mut self, commands: Vec<Command>) -> BoxFuture<'_, Result<Vec<Reply>, StoreError>>;

    fn load_script(&mut self, script: &Script) -> BoxFuture<'_, Result<ScriptHandle, StoreError>>;

    fn eval(
        &mut self,
        script: &ScriptHandle,
        keys: Vec<String>,
        args: Vec<String>,
    ) -> BoxFuture<'_, Result<Reply, StoreError>>;

    /// Pop the tail of `source` and push it onto the head of `destination`,
    /// waiting up to `timeout` for `source` to become non-empty.
    fn brpoplpush(
        &mut self,
        source: &str,
        destination: &str,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<Option<String>, StoreError>>;

    fn subscribe(
        self: Box<Self>,
        target: SubscribeTarget,
    ) -> BoxFuture<'static, Result<NotificationStream, StoreError>>;
}

/// Glob matching as used by pattern subscriptions: `*`, `?`, `[...]`
/// classes (with `^` negation and `a-z` ranges) and `\` escapes.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern = glob_tokens(pattern);
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some(Glob::Star) => {
                star = Some((p, t));
                p += 1;
            }
            Some(token) if token.matches(text[t]) => {
                p += 1;
                t += 1;
            }
            _ => match star {
                Some((sp, st)) => {
                    p = sp + 1;
                    t = st + 1;
                    star = Some((sp, st + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|token| matches!(token, Glob::Star))
}

enum Glob {
    Star,
    One,
    Literal(char),
    Class {
        negated: bool,
        ranges: Vec<(char, char)>,
    },
}

impl Glob {
    fn matches(&self, c: char) -> bool {
        match self {
            Glob::Star | Glob::One => true,
            Glob::Literal(l) => *l == c,
            Glob::Class { negated, ranges } => {
                ranges.iter().any(|(lo, hi)| (*lo..=*hi).contains(&c)) != *negated
            }
        }
    }
}

fn glob_tokens(pattern: &str) -> Vec<Glob> {
    let mut tokens = Vec::new();
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        let token = match c {
            '*' => Glob::Star,
            '?' => Glob::One,
            '\\' => Glob::Literal(chars.next().unwrap_or('\\')),
            '[' => {
                let negated = chars.next_if_eq(&'^').is_some();
                let mut ranges = Vec::new();
                while let Some(c) = chars.next() {
                    let lo = match c {
                        ']' => break,
                        '\\' => chars.next().unwrap_or('\\'),
                        c => c,
                    };
                    let hi = match chars.next_if_eq(&'-') {
                        Some(_) => match chars.next() {
                            Some('\\') => chars.next().unwrap_or('\\'),
                            Some(']') | None => {
                                ranges.push((lo, lo));
                                ranges.push(('-', '-'));
                                break;
                            }
                            Some(hi) => hi,
                        },
                        None => lo,
                    };
                    ranges.push(if lo <= hi { (lo, hi) } else { (hi, lo) });
                }
                Glob::Class { negated, ranges }
            }
            c => Glob::Literal(c),
        };
        tokens.push(token);
    }
    tokens
}
