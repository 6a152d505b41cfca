//! The worker runtime: polling loop, child execution, signal handling,
//! worker registry and dead-worker garbage collection.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use redis::{aio::ConnectionLike, AsyncCommands};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::Notify;
use tokio::task::AbortHandle;

use super::job::Job;
use super::keys::{Keys, FAILED_STAT, PROCESSED_STAT};
use super::queue::queue_names;
use super::{stat, status};
use crate::context::Context;
use crate::events::{Event, HookData};
use crate::models::job::{Envelope, Status};
use crate::models::{DateTime, RusqueError, RusqueResult};
use crate::redis_utils::RedisHandle;

/// Substring used to pick worker processes out of the process table when
/// pruning dead workers.
const PS_NAME_FILTER: &str = "rusque";

/// Queue name that makes a worker poll every known queue, in alphabetical
/// order, resolved fresh on each poll.
pub const WILDCARD_QUEUE: &str = "*";

/// The record written under `worker:<id>` while a job is executing.
#[derive(Debug, Deserialize, Serialize)]
pub struct WorkingOn {
    pub queue: String,
    pub run_at: String,
    pub payload: Envelope,
}

/// Outcome reported by a job's child execution.
enum ChildStatus {
    /// Handler ran to completion; counts as processed.
    Performed,

    /// A listener or `set_up` skipped the handler; counts as neither
    /// processed nor failed.
    Skipped,

    /// Handler failed; the child already recorded the failure.
    Failed,

    /// Something failed and the child could not record it; the parent must.
    Unrecorded(String),
}

/// Flags shared between the worker loop and its signal handling task.
///
/// Signal handlers only touch these flags (and the running child's abort
/// handle); all Redis work stays on the worker loop.
#[derive(Default)]
struct WorkerState {
    shutdown: AtomicBool,
    paused: AtomicBool,
    reconnect: AtomicBool,
    child: Mutex<Option<AbortHandle>>,
    wake: Notify,
}

impl WorkerState {
    fn shutdown_now(&self) {
        info!("Shutting down immediately, killing current job");
        self.shutdown.store(true, Ordering::SeqCst);
        self.kill_child();
        self.wake.notify_waiters();
    }

    fn shutdown_graceful(&self) {
        info!("Shutting down once current job finishes");
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    fn kill_child(&self) {
        let child = self.child.lock().unwrap();
        match child.as_ref() {
            Some(handle) => {
                info!("Killing running job");
                handle.abort();
            }
            None => debug!("No running job to kill"),
        }
    }

    fn pause(&self) {
        info!("Pausing job processing");
        self.paused.store(true, Ordering::SeqCst);
    }

    fn unpause(&self) {
        info!("Resuming job processing");
        self.paused.store(false, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    fn request_reconnect(&self) {
        self.reconnect.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    fn take_reconnect(&self) -> bool {
        self.reconnect.swap(false, Ordering::SeqCst)
    }
}

/// A worker: reserves jobs from its configured queues in priority order and
/// executes each inside an isolated child task with its own Redis connection.
///
/// Identified as `<hostname>:<pid>:<queues-csv>` for the life of the process.
pub struct Worker {
    context: Arc<Context>,
    queues: Vec<String>,
    id: String,
    hostname: String,
    redis: RedisHandle,
    state: Arc<WorkerState>,
}

impl Worker {
    /// Create a worker polling given queues in declaration order. A queue
    /// name of `*` makes the worker poll every known queue alphabetically.
    pub fn new(context: Arc<Context>, queues: Vec<String>) -> RusqueResult<Self> {
        if queues.is_empty() {
            return Err(RusqueError::InvalidArgument(
                "worker requires at least one queue".to_string(),
            ));
        }

        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());
        let id = format!("{}:{}:{}", hostname, std::process::id(), queues.join(","));
        let redis = context.open_redis()?;

        Ok(Self {
            context,
            queues,
            id,
            hostname,
            redis,
            state: Arc::new(WorkerState::default()),
        })
    }

    /// This worker's identity string.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Request graceful shutdown: the current job finishes, then the loop
    /// exits.
    pub fn shutdown(&self) {
        self.state.shutdown_graceful();
    }

    /// Request immediate shutdown, killing any running job.
    pub fn shutdown_now(&self) {
        self.state.shutdown_now();
    }

    /// Kill any running job, then keep working.
    pub fn kill_child(&self) {
        self.state.kill_child();
    }

    /// Stop reserving jobs until processing is resumed.
    pub fn pause_processing(&self) {
        self.state.pause();
    }

    /// Resume reserving jobs.
    pub fn unpause_processing(&self) {
        self.state.unpause();
    }

    /// The main loop: poll, reserve, execute, account, until shutdown.
    ///
    /// Sleeps `interval` seconds between empty polls. With an interval of
    /// zero the loop exits on the first empty poll instead, which gives a
    /// single-shot drain of the configured queues.
    pub async fn work(&mut self, interval: u64) -> RusqueResult<()> {
        self.startup().await?;

        while !self.state.shutdown.load(Ordering::SeqCst) {
            if self.state.take_reconnect() {
                info!("Re-establishing Redis connection");
                if let Err(err) = self.redis.reconnect().await {
                    error!("Failed to re-establish Redis connection: {}", err);
                }
            }

            let job = if self.state.paused.load(Ordering::SeqCst) {
                debug!("Paused, not reserving jobs");
                None
            } else {
                match self.reserve().await {
                    Ok(job) => job,
                    Err(err)
                        if matches!(
                            err,
                            RusqueError::Transport(_) | RusqueError::Connection(_)
                        ) =>
                    {
                        error!("Failed reserving job, treating as empty poll: {}", err);
                        None
                    }
                    Err(err) => return Err(err),
                }
            };

            let mut job = match job {
                Some(job) => job,
                None => {
                    if interval == 0 {
                        break;
                    }
                    debug!("Sleeping for {}s", interval);
                    self.sleep(interval).await;
                    continue;
                }
            };

            info!(
                "[queue:{}] reserved job {} ({})",
                &job.queue,
                job.id(),
                job.class()
            );
            job.set_worker(self.id.clone());

            if let Err(err) = self
                .context
                .events
                .trigger(Event::BeforeFork, &HookData::Job(&job))
            {
                if let Err(fail_err) = job.fail(&self.context, &mut self.redis, &err).await {
                    error!(
                        "Failed recording listener failure for job {}: {}",
                        job.id(),
                        fail_err
                    );
                }
                continue;
            }

            self.working_on(&job).await?;
            let performed = self.run_child(&job).await?;
            self.done_working(performed).await?;
        }

        self.unregister().await
    }

    async fn startup(&mut self) -> RusqueResult<()> {
        info!("Starting worker {}", &self.id);
        self.register_signal_handlers();
        self.prune_dead_workers().await?;
        self.context
            .events
            .trigger(Event::BeforeFirstFork, &HookData::Worker { id: &self.id })?;
        self.register_worker().await
    }

    /// Poll the active queues in priority order, returning the first job
    /// found.
    async fn reserve(&mut self) -> RusqueResult<Option<Job>> {
        let queues = self.active_queues().await?;
        let conn = self.redis.conn().await?;
        for queue in &queues {
            debug!("Checking {}", queue);
            if let Some(job) = Job::reserve(conn, &self.context.keys, queue).await? {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    /// Queues to poll this round. The wildcard resolves against the queue
    /// set fresh on every poll, picking up queues created after startup.
    async fn active_queues(&mut self) -> RusqueResult<Vec<String>> {
        if self.queues.iter().any(|q| q == WILDCARD_QUEUE) {
            let conn = self.redis.conn().await?;
            queue_names(conn, &self.context.keys).await
        } else {
            Ok(self.queues.clone())
        }
    }

    /// Execute given job in an isolated child task, reporting whether the
    /// handler ran to completion.
    ///
    /// The child opens its own Redis connection and does its own failure
    /// accounting; a killed or panicked child is recorded as a dirty exit by
    /// the parent.
    async fn run_child(&mut self, job: &Job) -> RusqueResult<bool> {
        let ctx = self.context.clone();
        let child_job = job.clone();
        let handle = tokio::spawn(async move { execute_child(ctx, child_job).await });

        *self.state.child.lock().unwrap() = Some(handle.abort_handle());
        let joined = handle.await;
        *self.state.child.lock().unwrap() = None;

        match joined {
            Ok(ChildStatus::Performed) => Ok(true),
            Ok(ChildStatus::Skipped) => {
                debug!("[job:{}] skipped", job.id());
                Ok(false)
            }
            Ok(ChildStatus::Failed) => Ok(false),
            Ok(ChildStatus::Unrecorded(msg)) => {
                self.record_dirty_exit(job, msg).await;
                Ok(false)
            }
            Err(join_err) => {
                let reason = if join_err.is_panic() {
                    let panic = join_err.into_panic();
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    format!("job execution panicked: {}", msg)
                } else {
                    "job execution was killed".to_string()
                };
                self.record_dirty_exit(job, reason).await;
                Ok(false)
            }
        }
    }

    /// Record a failure on behalf of a child that could not do so itself.
    async fn record_dirty_exit(&mut self, job: &Job, reason: String) {
        let err = RusqueError::dirty_exit(reason);
        if let Err(fail_err) = job.fail(&self.context, &mut self.redis, &err).await {
            error!(
                "Failed recording dirty exit for job {}: {}",
                job.id(),
                fail_err
            );
        }
    }

    /// Mark given job as this worker's current job.
    async fn working_on(&mut self, job: &Job) -> RusqueResult<()> {
        let record = WorkingOn {
            queue: job.queue.clone(),
            run_at: DateTime::now().to_string(),
            payload: job.envelope.clone(),
        };
        let raw = serde_json::to_string(&record)?;
        let conn = self.redis.conn().await?;
        status::update(conn, &self.context.keys, job.id(), Status::Running).await?;
        let _: () = conn.set(self.context.keys.worker(&self.id), raw).await?;
        Ok(())
    }

    /// Clear the current-job record; bump the processed counters when the
    /// handler ran to completion.
    async fn done_working(&mut self, performed: bool) -> RusqueResult<()> {
        let keys = &self.context.keys;
        let conn = self.redis.conn().await?;
        let _: () = conn.del(keys.worker(&self.id)).await?;
        if performed {
            stat::incr(conn, keys, PROCESSED_STAT, 1).await?;
            stat::incr(conn, keys, &format!("{}:{}", PROCESSED_STAT, &self.id), 1).await?;
        }
        Ok(())
    }

    /// Register this worker's identity and start time.
    async fn register_worker(&mut self) -> RusqueResult<()> {
        let keys = &self.context.keys;
        let conn = self.redis.conn().await?;
        let _: () = redis::pipe()
            .atomic()
            .sadd(keys.workers(), &self.id)
            .ignore()
            .set(keys.worker_started(&self.id), DateTime::now())
            .ignore()
            .query_async(conn)
            .await?;
        Ok(())
    }

    /// Unregister this worker on clean shutdown.
    async fn unregister(&mut self) -> RusqueResult<()> {
        info!("Unregistering worker {}", &self.id);
        Self::unregister_id(&self.context, &mut self.redis, &self.id).await
    }

    /// Remove every trace of given worker identity: fail any half-finished
    /// job it recorded, then drop its registry entries and stat counters.
    pub async fn unregister_id(
        ctx: &Context,
        redis: &mut RedisHandle,
        id: &str,
    ) -> RusqueResult<()> {
        let current: Option<String> = {
            let conn = redis.conn().await?;
            conn.get(ctx.keys.worker(id)).await?
        };
        if let Some(raw) = current {
            match serde_json::from_str::<WorkingOn>(&raw) {
                Ok(record) => {
                    let mut job = Job::new(record.queue, record.payload);
                    job.set_worker(id);
                    let err = RusqueError::dirty_exit("worker unregistered mid-job");
                    if let Err(fail_err) = job.fail(ctx, redis, &err).await {
                        error!("Failed failing in-flight job of worker {}: {}", id, fail_err);
                    }
                }
                Err(err) => warn!("Undecodable current-job record for worker {}: {}", id, err),
            }
        }

        let conn = redis.conn().await?;
        let _: () = redis::pipe()
            .atomic()
            .srem(ctx.keys.workers(), id)
            .ignore()
            .del(ctx.keys.worker(id))
            .ignore()
            .del(ctx.keys.worker_started(id))
            .ignore()
            .query_async(conn)
            .await?;
        stat::clear(conn, &ctx.keys, &format!("{}:{}", PROCESSED_STAT, id)).await?;
        stat::clear(conn, &ctx.keys, &format!("{}:{}", FAILED_STAT, id)).await?;
        Ok(())
    }

    /// Unregister workers registered from this host whose process no longer
    /// exists. Run once at startup, so crashed workers don't accumulate in
    /// the registry.
    pub async fn prune_dead_workers(&mut self) -> RusqueResult<()> {
        let live_pids = local_worker_pids().await;
        let my_pid = std::process::id();
        let workers = {
            let conn = self.redis.conn().await?;
            Self::all(conn, &self.context.keys).await?
        };

        for worker_id in workers {
            let (host, pid) = match parse_worker_id(&worker_id) {
                Some(parsed) => parsed,
                None => continue,
            };
            if host != self.hostname || live_pids.contains(&pid) || pid == my_pid {
                continue;
            }
            info!("Pruning dead worker: {}", &worker_id);
            Self::unregister_id(&self.context, &mut self.redis, &worker_id).await?;
        }
        Ok(())
    }

    /// All registered worker identities.
    pub async fn all<C: ConnectionLike + Send>(
        conn: &mut C,
        keys: &Keys,
    ) -> RusqueResult<Vec<String>> {
        Ok(conn.smembers(keys.workers()).await?)
    }

    /// Whether given worker identity is registered.
    pub async fn exists<C: ConnectionLike + Send>(
        conn: &mut C,
        keys: &Keys,
        id: &str,
    ) -> RusqueResult<bool> {
        Ok(conn.sismember(keys.workers(), id).await?)
    }

    /// Number of jobs this worker has processed to completion.
    pub async fn processed(&mut self) -> RusqueResult<i64> {
        let keys = self.context.keys.clone();
        let name = format!("{}:{}", PROCESSED_STAT, &self.id);
        let conn = self.redis.conn().await?;
        stat::get(conn, &keys, &name).await
    }

    /// Number of jobs this worker has failed.
    pub async fn failed(&mut self) -> RusqueResult<i64> {
        let keys = self.context.keys.clone();
        let name = format!("{}:{}", FAILED_STAT, &self.id);
        let conn = self.redis.conn().await?;
        stat::get(conn, &keys, &name).await
    }

    /// The job this worker is currently executing, if any.
    pub async fn job(&mut self) -> RusqueResult<Option<WorkingOn>> {
        let key = self.context.keys.worker(&self.id);
        let conn = self.redis.conn().await?;
        let raw: Option<String> = conn.get(key).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Sleep between empty polls, waking early on any signal.
    async fn sleep(&self, seconds: u64) {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
            _ = self.state.wake.notified() => {}
        }
    }

    /// Install the signal handling task. Handlers only set flags and abort
    /// the running child; the worker loop picks the flags up between Redis
    /// operations.
    ///
    /// | signal | effect |
    /// |---|---|
    /// | TERM, INT | shut down now, killing the running job |
    /// | QUIT | shut down once the current job finishes |
    /// | USR1 | kill the running job, keep working |
    /// | USR2 | pause processing |
    /// | CONT | resume processing |
    /// | PIPE | re-establish the Redis connection |
    fn register_signal_handlers(&self) {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let state = self.state.clone();
            tokio::spawn(async move {
                let streams = (
                    signal(SignalKind::terminate()),
                    signal(SignalKind::interrupt()),
                    signal(SignalKind::quit()),
                    signal(SignalKind::user_defined1()),
                    signal(SignalKind::user_defined2()),
                    signal(SignalKind::from_raw(libc::SIGCONT)),
                    signal(SignalKind::pipe()),
                );
                let (
                    Ok(mut term),
                    Ok(mut int),
                    Ok(mut quit),
                    Ok(mut usr1),
                    Ok(mut usr2),
                    Ok(mut cont),
                    Ok(mut pipe),
                ) = streams
                else {
                    warn!("Failed to install signal handlers");
                    return;
                };

                loop {
                    tokio::select! {
                        _ = term.recv() => { state.shutdown_now(); break; }
                        _ = int.recv() => { state.shutdown_now(); break; }
                        _ = quit.recv() => { state.shutdown_graceful(); break; }
                        _ = usr1.recv() => state.kill_child(),
                        _ = usr2.recv() => state.pause(),
                        _ = cont.recv() => state.unpause(),
                        _ = pipe.recv() => state.request_reconnect(),
                    }
                }
            });
        }
    }
}

impl fmt::Display for Worker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", &self.id)
    }
}

/// Run one job to completion inside its child task, with a Redis connection
/// of its own.
async fn execute_child(ctx: Arc<Context>, job: Job) -> ChildStatus {
    let mut redis = match ctx.open_redis() {
        Ok(redis) => redis,
        Err(err) => {
            return ChildStatus::Unrecorded(format!("could not open Redis in child: {}", err))
        }
    };

    if let Err(err) = ctx.events.trigger(Event::AfterFork, &HookData::Job(&job)) {
        return record_failure(&ctx, &mut redis, &job, err).await;
    }

    match job.perform(&ctx).await {
        Ok(true) => {
            let updated = async {
                let conn = redis.conn().await?;
                job.update_status(conn, &ctx.keys, Status::Complete).await
            }
            .await;
            if let Err(err) = updated {
                error!("[job:{}] failed updating status: {}", job.id(), err);
            }
            info!("[job:{}] done", job.id());
            ChildStatus::Performed
        }
        Ok(false) => ChildStatus::Skipped,
        Err(err) => record_failure(&ctx, &mut redis, &job, err).await,
    }
}

async fn record_failure(
    ctx: &Context,
    redis: &mut RedisHandle,
    job: &Job,
    err: RusqueError,
) -> ChildStatus {
    match job.fail(ctx, redis, &err).await {
        Ok(()) => ChildStatus::Failed,
        Err(fail_err) => {
            ChildStatus::Unrecorded(format!("{} (recording failed: {})", err, fail_err))
        }
    }
}

/// Process ids of worker processes running on this host, via the process
/// table. Errors degrade to an empty list, leaving pruning to the pid checks.
async fn local_worker_pids() -> Vec<u32> {
    let output = match Command::new("ps").args(["-A", "-o", "pid=,args="]).output().await {
        Ok(output) => output,
        Err(err) => {
            warn!("Failed to list processes: {}", err);
            return Vec::new();
        }
    };

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter(|line| line.contains(PS_NAME_FILTER))
        .filter_map(|line| line.split_whitespace().next()?.parse().ok())
        .collect()
}

/// Split a worker identity into its host and pid. Queue names may themselves
/// contain `:`, so only the first two fields are parsed.
fn parse_worker_id(id: &str) -> Option<(&str, u32)> {
    let mut parts = id.splitn(3, ':');
    let host = parts.next()?;
    let pid = parts.next()?.parse().ok()?;
    parts.next()?;
    Some((host, pid))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn worker_id_parsing() {
        assert_eq!(parse_worker_id("host:123:jobs"), Some(("host", 123)));
        assert_eq!(parse_worker_id("host:123:high,low"), Some(("host", 123)));
        assert_eq!(parse_worker_id("host:abc:jobs"), None);
        assert_eq!(parse_worker_id("host:123"), None);
        assert_eq!(parse_worker_id("garbage"), None);
    }
}
