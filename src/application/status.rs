//! Tracks per-job lifecycle status records with a bounded lifetime.

use log::debug;
use redis::{aio::ConnectionLike, AsyncCommands};
use serde::{Deserialize, Serialize};

use super::keys::{Keys, STATUS_TTL_SECS};
use crate::models::job::Status;
use crate::models::{DateTime, RusqueResult};

/// The JSON record stored under `job:<id>:status`.
///
/// Every write refreshes the record's TTL, so observers must tolerate it
/// disappearing after the tracking window lapses.
#[derive(Debug, Deserialize, Serialize)]
pub struct StatusRecord {
    pub status: Status,
    pub updated: i64,
    pub started: i64,
}

/// Start tracking given job id, marking it as waiting.
pub async fn create<C: ConnectionLike + Send>(
    conn: &mut C,
    keys: &Keys,
    job_id: &str,
) -> RusqueResult<()> {
    let now = DateTime::now().unix();
    let record = StatusRecord {
        status: Status::Waiting,
        updated: now,
        started: now,
    };
    write(conn, keys, job_id, &record).await
}

/// Update the status of given job id, refreshing the record's TTL.
///
/// Does nothing when the job is not tracked (or tracking has expired).
pub async fn update<C: ConnectionLike + Send>(
    conn: &mut C,
    keys: &Keys,
    job_id: &str,
    status: Status,
) -> RusqueResult<()> {
    let existing: Option<String> = conn.get(keys.status(job_id)).await?;
    let raw = match existing {
        Some(raw) => raw,
        None => return Ok(()),
    };

    let now = DateTime::now().unix();
    let started = serde_json::from_str::<StatusRecord>(&raw)
        .map(|record| record.started)
        .unwrap_or(now);
    let record = StatusRecord {
        status,
        updated: now,
        started,
    };
    debug!("[job:{}] status -> {}", job_id, status);
    write(conn, keys, job_id, &record).await
}

/// Get the tracked status of given job id, or `None` when untracked.
pub async fn get<C: ConnectionLike + Send>(
    conn: &mut C,
    keys: &Keys,
    job_id: &str,
) -> RusqueResult<Option<Status>> {
    let raw: Option<String> = conn.get(keys.status(job_id)).await?;
    match raw {
        Some(raw) => {
            let record: StatusRecord = serde_json::from_str(&raw)?;
            Ok(Some(record.status))
        }
        None => Ok(None),
    }
}

/// Whether given job id currently has a status record.
pub async fn is_tracking<C: ConnectionLike + Send>(
    conn: &mut C,
    keys: &Keys,
    job_id: &str,
) -> RusqueResult<bool> {
    Ok(conn.exists(keys.status(job_id)).await?)
}

/// Stop tracking given job id.
pub async fn stop<C: ConnectionLike + Send>(
    conn: &mut C,
    keys: &Keys,
    job_id: &str,
) -> RusqueResult<()> {
    let _: () = conn.del(keys.status(job_id)).await?;
    Ok(())
}

async fn write<C: ConnectionLike + Send>(
    conn: &mut C,
    keys: &Keys,
    job_id: &str,
    record: &StatusRecord,
) -> RusqueResult<()> {
    let raw = serde_json::to_string(record)?;
    let _: () = conn.set_ex(keys.status(job_id), raw, STATUS_TTL_SECS).await?;
    Ok(())
}
