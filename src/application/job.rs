//! Defines most application logic that's based around jobs.

use log::{debug, warn};
use redis::aio::ConnectionLike;
use serde_json::Value;
use uuid::Uuid;

use super::failure::FailureRecord;
use super::keys::{Keys, FAILED_STAT};
use super::queue::Queue;
use super::{stat, status};
use crate::context::Context;
use crate::events::{Event, HookData, HookFlow};
use crate::models::job::{Envelope, Status};
use crate::models::{RusqueError, RusqueResult};
use crate::redis_utils::RedisHandle;

/// A reserved job: the queue it came from, its wire envelope, and, while
/// executing, the identity of the worker that holds it.
#[derive(Clone, Debug)]
pub struct Job {
    /// Name of the queue this job was reserved from.
    pub queue: String,

    /// The job's wire envelope.
    pub envelope: Envelope,

    worker: Option<String>,
}

impl Job {
    pub fn new<S: Into<String>>(queue: S, envelope: Envelope) -> Self {
        Self {
            queue: queue.into(),
            envelope,
            worker: None,
        }
    }

    /// This job's identity string.
    pub fn id(&self) -> &str {
        &self.envelope.id
    }

    /// The handler class name this job carries.
    pub fn class(&self) -> &str {
        &self.envelope.class
    }

    /// The caller's argument mapping.
    pub fn arguments(&self) -> &Value {
        self.envelope.arguments()
    }

    /// Identity of the worker executing this job, if any.
    pub fn worker(&self) -> Option<&str> {
        self.worker.as_deref()
    }

    /// Record the worker that reserved this job, so failure accounting can be
    /// attributed to it.
    pub fn set_worker<S: Into<String>>(&mut self, id: S) {
        self.worker = Some(id.into());
    }

    /// Create a new job on given queue, returning its identity.
    ///
    /// `args` must be absent or a mapping. When the mapping carries an `id`
    /// member, that identity is reused and the job is treated as a recreation
    /// of an earlier one; otherwise a fresh identity is minted.
    pub async fn create<C: ConnectionLike + Send>(
        conn: &mut C,
        keys: &Keys,
        queue: &str,
        class: &str,
        args: Option<Value>,
        track: bool,
    ) -> RusqueResult<String> {
        if let Some(args) = &args {
            if !args.is_object() {
                return Err(RusqueError::InvalidArgument(
                    "job arguments must be a mapping".to_string(),
                ));
            }
        }

        let (id, recreated) = match args
            .as_ref()
            .and_then(|a| a.get("id"))
            .and_then(|v| v.as_str())
        {
            Some(id) => (id.to_string(), true),
            None => (new_job_id(), false),
        };

        Self::create_with_id(conn, keys, queue, class, args, track, id, recreated).await
    }

    async fn create_with_id<C: ConnectionLike + Send>(
        conn: &mut C,
        keys: &Keys,
        queue: &str,
        class: &str,
        args: Option<Value>,
        track: bool,
        id: String,
        recreated: bool,
    ) -> RusqueResult<String> {
        let envelope = Envelope::new(class, args, id.clone());
        Queue::new(keys, queue).push(conn, &envelope).await?;

        if recreated {
            if status::is_tracking(conn, keys, &id).await? {
                status::update(conn, keys, &id, Status::Waiting).await?;
            } else if track {
                status::create(conn, keys, &id).await?;
            }
        } else if track {
            status::create(conn, keys, &id).await?;
        }

        debug!("[queue:{}] created job {} ({})", queue, id, class);
        Ok(id)
    }

    /// Reserve the next job from given queue, if any.
    pub async fn reserve<C: ConnectionLike + Send>(
        conn: &mut C,
        keys: &Keys,
        queue: &str,
    ) -> RusqueResult<Option<Job>> {
        match Queue::new(keys, queue).pop(conn).await? {
            Some(envelope) => Ok(Some(Job::new(queue, envelope))),
            None => Ok(None),
        }
    }

    /// Run this job's handler, bracketed by the lifecycle hooks.
    ///
    /// Returns `false` when a `BeforePerform` listener or the handler's
    /// `set_up` asked for the job to be skipped; the handler does not run and
    /// `AfterPerform` is not fired. Handler errors propagate to the caller,
    /// which records them via [`Job::fail`].
    pub async fn perform(&self, ctx: &Context) -> RusqueResult<bool> {
        let handler = ctx.registry.resolve(self.class())?;

        if ctx.events.trigger(Event::BeforePerform, &HookData::Job(self))?
            == HookFlow::DontPerform
        {
            debug!("[job:{}] skipped before perform", self.id());
            return Ok(false);
        }

        match handler
            .set_up(self)
            .await
            .map_err(|err| RusqueError::handler(err.to_string()))?
        {
            HookFlow::DontPerform => {
                debug!("[job:{}] skipped in set up", self.id());
                return Ok(false);
            }
            HookFlow::Continue => {}
        }

        handler
            .perform(self)
            .await
            .map_err(|err| RusqueError::handler(err.to_string()))?;
        handler
            .tear_down(self)
            .await
            .map_err(|err| RusqueError::handler(err.to_string()))?;

        ctx.events.trigger(Event::AfterPerform, &HookData::Job(self))?;
        Ok(true)
    }

    /// Record this job as failed: fire the failure hook, mark any tracked
    /// status, persist the failure envelope and bump the failure counters.
    pub async fn fail(
        &self,
        ctx: &Context,
        redis: &mut RedisHandle,
        err: &RusqueError,
    ) -> RusqueResult<()> {
        warn!("[queue:{}] job {} failed: {}", &self.queue, self.id(), err);
        ctx.events.trigger(
            Event::OnFailure,
            &HookData::Failure {
                error: err,
                job: self,
            },
        )?;

        {
            let conn = redis.conn().await?;
            status::update(conn, &ctx.keys, self.id(), Status::Failed).await?;
        }

        let record = FailureRecord::new(
            self.envelope.clone(),
            err,
            self.worker.as_deref().unwrap_or(""),
            &self.queue,
        );
        ctx.failure.create(redis, &ctx.keys, record).await?;

        let conn = redis.conn().await?;
        stat::incr(conn, &ctx.keys, FAILED_STAT, 1).await?;
        if let Some(worker) = &self.worker {
            stat::incr(conn, &ctx.keys, &format!("{}:{}", FAILED_STAT, worker), 1).await?;
        }
        Ok(())
    }

    /// Republish this job's class and arguments on the same queue under a
    /// fresh identity. Tracking is re-established on the new identity when
    /// the original was tracked.
    pub async fn recreate<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        keys: &Keys,
    ) -> RusqueResult<String> {
        let tracked = status::is_tracking(conn, keys, self.id()).await?;
        let args = match self.envelope.arguments() {
            Value::Null => None,
            value => Some(value.clone()),
        };
        Self::create_with_id(
            conn,
            keys,
            &self.queue,
            self.class(),
            args,
            tracked,
            new_job_id(),
            false,
        )
        .await
    }

    /// The tracked status of this job, or `None` when untracked.
    pub async fn status<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        keys: &Keys,
    ) -> RusqueResult<Option<Status>> {
        status::get(conn, keys, self.id()).await
    }

    /// Update this job's tracked status. Does nothing when untracked.
    pub async fn update_status<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        keys: &Keys,
        new_status: Status,
    ) -> RusqueResult<()> {
        status::update(conn, keys, self.id(), new_status).await
    }
}

/// Mint a fresh 128-bit hex job identity.
fn new_job_id() -> String {
    Uuid::new_v4().simple().to_string()
}
