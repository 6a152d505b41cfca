//! Persists post-mortem records for failed jobs.

use std::backtrace::Backtrace;

use async_trait::async_trait;
use log::error;
use redis::AsyncCommands;
use serde::Serialize;

use super::keys::{Keys, FAILED_TTL_SECS};
use crate::models::job::Envelope;
use crate::models::{DateTime, RusqueError, RusqueResult};
use crate::redis_utils::RedisHandle;

/// The envelope persisted under `failed:<id>` when a job fails.
#[derive(Debug, Serialize)]
pub struct FailureRecord {
    pub failed_at: String,
    pub payload: Envelope,
    pub exception: String,
    pub error: String,
    pub backtrace: Vec<String>,
    pub worker: String,
    pub queue: String,
}

impl FailureRecord {
    /// Build a record for given failure, capturing a backtrace of the
    /// recording site.
    pub fn new(payload: Envelope, err: &RusqueError, worker: &str, queue: &str) -> Self {
        let backtrace = Backtrace::force_capture()
            .to_string()
            .lines()
            .map(|line| line.trim().to_string())
            .collect();
        Self {
            failed_at: DateTime::now().to_string(),
            payload,
            exception: err.exception_kind().to_string(),
            error: err.to_string(),
            backtrace,
            worker: worker.to_string(),
            queue: queue.to_string(),
        }
    }
}

/// Backend that persists failure records. Selected process-wide when the
/// runtime context is built, so hosts may redirect failures without touching
/// the job pipeline.
#[async_trait]
pub trait FailureBackend: Send + Sync {
    async fn create(
        &self,
        redis: &mut RedisHandle,
        keys: &Keys,
        record: FailureRecord,
    ) -> RusqueResult<()>;
}

/// Default backend: writes `failed:<id>` with a bounded lifetime.
pub struct RedisFailureBackend;

#[async_trait]
impl FailureBackend for RedisFailureBackend {
    async fn create(
        &self,
        redis: &mut RedisHandle,
        keys: &Keys,
        record: FailureRecord,
    ) -> RusqueResult<()> {
        let key = keys.failed(&record.payload.id);
        let raw = serde_json::to_string(&record)?;
        let conn = redis.conn().await?;
        let _: () = conn.set_ex(key, raw, FAILED_TTL_SECS).await?;
        Ok(())
    }
}

/// Alternative backend that emits failures to the log sink instead of Redis.
pub struct LogFailureBackend;

#[async_trait]
impl FailureBackend for LogFailureBackend {
    async fn create(
        &self,
        _redis: &mut RedisHandle,
        _keys: &Keys,
        record: FailureRecord,
    ) -> RusqueResult<()> {
        error!(
            "[{}] job {} failed on {}: {}: {}",
            record.queue, record.payload.id, record.worker, record.exception, record.error
        );
        Ok(())
    }
}
