//! Defines convenience interface to a queue in Redis.

use log::{debug, info};
use redis::{aio::ConnectionLike, AsyncCommands};
use serde_json::Value;

use super::keys::Keys;
use crate::models::job::Envelope;
use crate::models::{DateTime, RusqueResult};

/// Describes which envelopes a selective removal should discard.
#[derive(Clone, Debug)]
pub enum MatchSpec {
    /// Matches every envelope with given class name.
    Class(String),

    /// Matches envelopes with given class name and envelope id.
    ClassWithId { class: String, id: String },

    /// Matches envelopes with given class name whose argument values are all
    /// present among this mapping's values.
    ///
    /// The comparison is value-wise, not key-wise, mirroring the original
    /// wire-compatible behaviour.
    ClassWithArgs {
        class: String,
        args: serde_json::Map<String, Value>,
    },
}

impl MatchSpec {
    /// Whether given envelope should be removed under this spec.
    pub fn matches(&self, envelope: &Envelope) -> bool {
        match self {
            MatchSpec::Class(class) => &envelope.class == class,
            MatchSpec::ClassWithId { class, id } => {
                &envelope.class == class && &envelope.id == id
            }
            MatchSpec::ClassWithArgs { class, args } => {
                &envelope.class == class && values_subset(envelope.arguments(), args)
            }
        }
    }
}

/// True when every value in `decoded` appears among the values of `spec`.
fn values_subset(decoded: &Value, spec: &serde_json::Map<String, Value>) -> bool {
    let decoded = match decoded {
        Value::Object(map) => map,
        _ => return false,
    };
    decoded
        .values()
        .all(|v| spec.values().any(|candidate| candidate == v))
}

/// Interface to a single named queue: a Redis list of JSON job envelopes,
/// plus membership in the global queue set.
#[derive(Debug)]
pub struct Queue<'a> {
    keys: &'a Keys,

    /// Name of the queue.
    pub name: String,

    /// Redis key of the queue's envelope list.
    pub key: String,
}

impl<'a> Queue<'a> {
    pub fn new<S: Into<String>>(keys: &'a Keys, name: S) -> Self {
        let name = name.into();
        let key = keys.queue(&name);
        Self { keys, name, key }
    }

    /// Append an envelope to the tail of this queue, registering the queue
    /// name in the queue set on first use.
    pub async fn push<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        envelope: &Envelope,
    ) -> RusqueResult<()> {
        let encoded = envelope.encode()?;
        let _: () = redis::pipe()
            .atomic()
            .sadd(self.keys.queues(), &self.name)
            .ignore()
            .rpush(&self.key, encoded)
            .ignore()
            .query_async(conn)
            .await?;
        debug!("[{}] pushed {}", &self.key, envelope.id);
        Ok(())
    }

    /// Reserve the envelope at the head of this queue, if any.
    pub async fn pop<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
    ) -> RusqueResult<Option<Envelope>> {
        let raw: Option<String> = conn.lpop(&self.key, None).await?;
        match raw {
            Some(raw) => Ok(Some(Envelope::decode(&raw)?)),
            None => Ok(None),
        }
    }

    /// Number of envelopes currently queued.
    pub async fn size<C: ConnectionLike + Send>(&self, conn: &mut C) -> RusqueResult<u64> {
        Ok(conn.llen(&self.key).await?)
    }

    /// Delete every queued envelope, returning how many were removed.
    pub async fn clear<C: ConnectionLike + Send>(&self, conn: &mut C) -> RusqueResult<u64> {
        let (size, _): (u64, u64) = redis::pipe()
            .atomic()
            .llen(&self.key)
            .del(&self.key)
            .query_async(conn)
            .await?;
        info!("[{}] cleared {} envelopes", &self.key, size);
        Ok(size)
    }

    /// Selectively remove matching envelopes, returning how many were removed.
    ///
    /// Survivors keep their relative order. Envelopes pushed concurrently
    /// while the removal runs end up after the survivors; concurrent selective
    /// removals on the same queue must be serialised by the operator.
    pub async fn remove<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        specs: &[MatchSpec],
    ) -> RusqueResult<u64> {
        if specs.is_empty() {
            return self.clear(conn).await;
        }

        let temp_key = format!("{}:temp:{}", &self.key, DateTime::now().unix());
        let requeue_key = format!("{}:requeue", &temp_key);
        let mut removed = 0u64;

        // Drain: rotate every envelope off the tail into the temp list,
        // discarding matches and parking survivors on the requeue list.
        loop {
            let raw: Option<String> = conn.rpoplpush(&self.key, &temp_key).await?;
            let raw = match raw {
                Some(raw) => raw,
                None => break,
            };

            // an undecodable element is treated as a non-match and kept
            let is_match = match Envelope::decode(&raw) {
                Ok(envelope) => specs.iter().any(|spec| spec.matches(&envelope)),
                Err(_) => false,
            };

            if is_match {
                let _: Option<String> = conn.rpop(&temp_key, None).await?;
                removed += 1;
            } else {
                let _: Option<String> = conn.rpoplpush(&temp_key, &requeue_key).await?;
            }
        }

        // Restore: rotate survivors back onto the queue, restoring their
        // original relative order.
        loop {
            let raw: Option<String> = conn.rpoplpush(&requeue_key, &self.key).await?;
            if raw.is_none() {
                break;
            }
        }

        let _: () = conn.del(vec![&temp_key, &requeue_key]).await?;

        info!("[{}] removed {} envelopes", &self.key, removed);
        Ok(removed)
    }
}

/// Get the sorted list of all known queue names.
pub async fn queue_names<C: ConnectionLike + Send>(
    conn: &mut C,
    keys: &Keys,
) -> RusqueResult<Vec<String>> {
    let mut names: Vec<String> = conn.smembers(keys.queues()).await?;
    names.sort();
    Ok(names)
}
