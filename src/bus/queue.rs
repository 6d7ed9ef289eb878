//! Pending work queue.
//!
//! Sessions wait in one sorted set scored by enqueue timestamp. Claims run
//! as a store-side script so that concurrent workers can never take the same
//! entry; equal timestamps are served in insertion order.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::publisher::Publisher;
use crate::naming::Names;
use crate::store::{Command, Reply, Script, ScriptContext};
use crate::utils::{BusError, StoreError};

/// A session handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub session: String,
    pub content: String,
}

/// Payload published on the destroy channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestroyNotice {
    #[serde(rename = "sessCode")]
    pub sess_code: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TornDownBy {
    Worker,
    User,
}

const CLAIM_LUA: &str = r#"
local pending = KEYS[1]
local ns, token, expiry = ARGV[1], ARGV[2], tonumber(ARGV[3])
while true do
  local head = redis.call('ZRANGE', pending, 0, 0)
  if #head == 0 then return false end
  local code = head[1]
  redis.call('ZREM', pending, code)
  local session = ns .. ':session:' .. code
  local content = redis.call('HGET', session, 'content')
  if content then
    redis.call('HSET', session, 'token', token)
    redis.call('EXPIRE', ns .. ':output:' .. code, expiry)
    return {code, content}
  end
end
"#;

/// KEYS: pending set. ARGV: namespace, worker token, expiry seconds.
///
/// Entries whose session record is already gone (torn down by the user
/// before any worker claimed them) are dropped and the next one is tried.
pub const CLAIM_SCRIPT: Script = Script {
    name: "sessionbus_claim",
    lua: CLAIM_LUA,
    native: claim_native,
};

fn claim_native(
    ctx: &mut dyn ScriptContext,
    keys: &[String],
    args: &[String],
) -> Result<Reply, StoreError> {
    let [pending] = keys else {
        return Err(StoreError::Script(format!(
            "claim expects 1 key, got {}",
            keys.len()
        )));
    };
    let [namespace, token, expiry] = args else {
        return Err(StoreError::Script(format!(
            "claim expects 3 args, got {}",
            args.len()
        )));
    };
    let expiry: u64 = expiry
        .parse()
        .map_err(|_| StoreError::Script(format!("invalid expiry {expiry:?}")))?;
    let names = Names::new(namespace.as_str());

    loop {
        let head = ctx.call(Command::ZRange {
            key: pending.clone(),
            start: 0,
            stop: 0,
            with_scores: false,
        })?;
        let code = match head {
            Reply::Array(mut members) => match members.pop() {
                Some(Reply::Bulk(code)) => code,
                _ => return Ok(Reply::Nil),
            },
            other => return Err(StoreError::Script(format!("unexpected ZRANGE reply {other:?}"))),
        };
        ctx.call(Command::ZRem {
            key: pending.clone(),
            member: code.clone(),
        })?;

        let session = names.session(&code);
        let Reply::Bulk(content) = ctx.call(Command::hget(session.as_str(), "content"))? else {
            continue;
        };
        ctx.call(Command::hset(session, [("token", token.as_str())]))?;
        ctx.call(Command::Expire {
            key: names.output(&code),
            seconds: expiry,
        })?;
        return Ok(Reply::Array(vec![Reply::Bulk(code), Reply::Bulk(content)]));
    }
}

impl Publisher {
    /// Queue a session for the worker pool.
    ///
    /// Adds the pending entry, writes the session record with `live=false`
    /// and sets both traffic markers to `timestamp`, all in one transaction.
    pub async fn enqueue(&self, code: &str, content: &str, timestamp: i64) -> Result<(), BusError> {
        let names = &self.names;
        self.exec(
            "enqueue",
            vec![
                Command::ZAdd {
                    key: names.pending(),
                    score: timestamp,
                    member: code.to_string(),
                },
                Command::hset(names.session(code), [("content", content), ("live", "false")]),
                Command::set(names.input(code), timestamp.to_string()),
                Command::set(names.output(code), timestamp.to_string()),
            ],
        )
        .await?;
        debug!(session = %code, timestamp, "session enqueued");
        Ok(())
    }

    /// `enqueue` stamped with the current time in milliseconds.
    pub async fn enqueue_now(&self, code: &str, content: &str) -> Result<(), BusError> {
        self.enqueue(code, content, Utc::now().timestamp_millis())
            .await
    }

    /// Register the claim script with the store. Required before `claim`.
    pub async fn enable_claims(&mut self) -> Result<(), BusError> {
        let result = self
            .connection
            .get_mut()
            .load_script(&CLAIM_SCRIPT)
            .await
            .map_err(BusError::from);
        match result {
            Ok(handle) => {
                self.claim_script = Some(handle);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "claim script registration failed");
                Err(e)
            }
        }
    }

    pub fn claims_enabled(&self) -> bool {
        self.claim_script.is_some()
    }

    /// Take the oldest pending session, or `None` when the queue is empty.
    pub async fn claim(&self) -> Result<Option<Claim>, BusError> {
        let script = self
            .claim_script
            .as_ref()
            .ok_or(BusError::ClaimScriptNotLoaded)?;

        let reply = self
            .eval(
                "claim",
                script,
                vec![self.names.pending()],
                vec![
                    self.names.namespace().to_string(),
                    self.settings.worker_token.clone(),
                    self.settings.expiry_secs.to_string(),
                ],
            )
            .await?;

        match reply {
            Reply::Nil => Ok(None),
            Reply::Array(items) => match <[Reply; 2]>::try_from(items) {
                Ok([Reply::Bulk(session), Reply::Bulk(content)]) => {
                    info!(session = %session, "session claimed");
                    Ok(Some(Claim { session, content }))
                }
                other => Err(BusError::UnexpectedReply {
                    op: "claim",
                    reply: format!("{other:?}"),
                }),
            },
            other => Err(BusError::UnexpectedReply {
                op: "claim",
                reply: format!("{other:?}"),
            }),
        }
    }

    /// Worker-initiated teardown; also drops any pending entry left behind.
    pub async fn teardown_by_worker(&self, code: &str, reason: &str) -> Result<(), BusError> {
        self.teardown(code, reason, TornDownBy::Worker).await
    }

    pub async fn teardown_by_user(&self, code: &str, reason: &str) -> Result<(), BusError> {
        self.teardown(code, reason, TornDownBy::User).await
    }

    async fn teardown(&self, code: &str, reason: &str, by: TornDownBy) -> Result<(), BusError> {
        let names = &self.names;
        let notice = serde_json::to_string(&DestroyNotice {
            sess_code: code.to_string(),
            message: reason.to_string(),
        })?;

        let mut commands = vec![Command::Del {
            keys: vec![names.session(code), names.input(code), names.output(code)],
        }];
        let channel = match by {
            TornDownBy::Worker => {
                commands.push(Command::ZRem {
                    key: names.pending(),
                    member: code.to_string(),
                });
                names.destroy_by_worker()
            }
            TornDownBy::User => names.destroy_by_user(),
        };
        commands.push(Command::publish(channel, notice));

        self.exec("teardown", commands).await?;
        info!(session = %code, by = ?by, reason, "session torn down");
        Ok(())
    }

    pub async fn pending_len(&self) -> Result<usize, BusError> {
        let reply = self
            .query(
                "pending_len",
                Command::ZCard {
                    key: self.names.pending(),
                },
            )
            .await?;
        reply
            .as_int()
            .map(|n| n.max(0) as usize)
            .ok_or_else(|| BusError::UnexpectedReply {
                op: "pending_len",
                reply: format!("{reply:?}"),
            })
    }

    /// Pending sessions with their enqueue timestamps, oldest first.
    pub async fn pending(&self) -> Result<Vec<(String, i64)>, BusError> {
        let reply = self
            .query(
                "pending",
                Command::ZRange {
                    key: self.names.pending(),
                    start: 0,
                    stop: -1,
                    with_scores: true,
                },
            )
            .await?;
        let Reply::Array(items) = reply else {
            return Err(BusError::UnexpectedReply {
                op: "pending",
                reply: format!("{reply:?}"),
            });
        };

        items
            .chunks(2)
            .map(|pair| match pair {
                [Reply::Bulk(code), Reply::Int(score)] => Ok((code.clone(), *score)),
                other => Err(BusError::UnexpectedReply {
                    op: "pending",
                    reply: format!("{other:?}"),
                }),
            })
            .collect()
    }
}
