//! The runtime context threaded through producers, jobs and workers.

use log::debug;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::application::failure::{FailureBackend, RedisFailureBackend};
use crate::application::job::Job;
use crate::application::keys::Keys;
use crate::application::queue::{self, MatchSpec, Queue};
use crate::application::status;
use crate::config::Config;
use crate::events::{Event, EventBus, HookData, HookFlow};
use crate::models::job::Status;
use crate::models::RusqueResult;
use crate::redis_utils::RedisHandle;

/// Holds everything a process shares across producer calls, workers and job
/// executions: configuration, key layout, lifecycle listeners, the handler
/// registry and the failure backend.
///
/// Constructed once at startup and shared behind an `Arc`. Tests build
/// isolated contexts with their own namespaces. The context owns one Redis
/// connection for producer calls; workers and child executions open their
/// own.
pub struct Context {
    pub config: Config,
    pub keys: Keys,
    pub events: EventBus,
    pub registry: crate::registry::HandlerRegistry,
    pub failure: Box<dyn FailureBackend>,
    redis: Mutex<RedisHandle>,
}

impl Context {
    /// Build a context from given configuration, with an empty handler
    /// registry and the default Redis failure backend. Populate `registry`
    /// (and optionally replace `failure`) before wrapping in an `Arc`.
    pub fn new(config: Config) -> RusqueResult<Self> {
        let keys = Keys::new(config.redis.namespace.clone());
        let redis = RedisHandle::new(&config.redis)?;
        Ok(Self {
            config,
            keys,
            events: EventBus::new(),
            registry: crate::registry::HandlerRegistry::new(),
            failure: Box::new(RedisFailureBackend),
            redis: Mutex::new(redis),
        })
    }

    /// Enqueue a job of given class with given arguments.
    ///
    /// Durable in Redis before this returns. Returns the new job's identity,
    /// or `None` when a `BeforeEnqueue` listener aborted the enqueue.
    pub async fn enqueue(
        &self,
        queue: &str,
        class: &str,
        args: Option<Value>,
        track_status: bool,
    ) -> RusqueResult<Option<String>> {
        let hook_args = args.clone().unwrap_or(Value::Null);
        let data = HookData::Enqueue {
            class,
            args: &hook_args,
            queue,
        };
        if self.events.trigger(Event::BeforeEnqueue, &data)? == HookFlow::DontPerform {
            debug!("[queue:{}] enqueue of {} aborted by listener", queue, class);
            return Ok(None);
        }

        let id = {
            let mut redis = self.redis.lock().await;
            let conn = redis.conn().await?;
            Job::create(conn, &self.keys, queue, class, args, track_status).await?
        };

        self.events.trigger(Event::AfterEnqueue, &data)?;
        Ok(Some(id))
    }

    /// Selectively remove queued jobs matching any of given specs; with no
    /// specs, the whole queue is dropped. Returns how many were removed.
    pub async fn dequeue(&self, queue: &str, specs: &[MatchSpec]) -> RusqueResult<u64> {
        let mut redis = self.redis.lock().await;
        let conn = redis.conn().await?;
        Queue::new(&self.keys, queue).remove(conn, specs).await
    }

    /// Number of jobs currently queued on given queue.
    pub async fn size(&self, queue: &str) -> RusqueResult<u64> {
        let mut redis = self.redis.lock().await;
        let conn = redis.conn().await?;
        Queue::new(&self.keys, queue).size(conn).await
    }

    /// Sorted list of all known queue names.
    pub async fn queues(&self) -> RusqueResult<Vec<String>> {
        let mut redis = self.redis.lock().await;
        let conn = redis.conn().await?;
        queue::queue_names(conn, &self.keys).await
    }

    /// Tracked status of given job id, or `None` when untracked.
    pub async fn job_status(&self, job_id: &str) -> RusqueResult<Option<Status>> {
        let mut redis = self.redis.lock().await;
        let conn = redis.conn().await?;
        status::get(conn, &self.keys, job_id).await
    }

    /// Open a fresh Redis connection handle from this context's
    /// configuration. Used by workers and child executions, which must not
    /// share the producer connection.
    pub fn open_redis(&self) -> RusqueResult<RedisHandle> {
        RedisHandle::new(&self.config.redis)
    }
}
