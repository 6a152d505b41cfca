//! Monotonic stat counters, built directly on Redis integer keys.

use redis::{aio::ConnectionLike, AsyncCommands};

use super::keys::Keys;
use crate::models::RusqueResult;

/// Get the current value of given counter. An absent key reads as zero.
pub async fn get<C: ConnectionLike + Send>(
    conn: &mut C,
    keys: &Keys,
    name: &str,
) -> RusqueResult<i64> {
    let value: Option<i64> = conn.get(keys.stat(name)).await?;
    Ok(value.unwrap_or(0))
}

/// Increment given counter.
pub async fn incr<C: ConnectionLike + Send>(
    conn: &mut C,
    keys: &Keys,
    name: &str,
    by: i64,
) -> RusqueResult<()> {
    let _: i64 = conn.incr(keys.stat(name), by).await?;
    Ok(())
}

/// Decrement given counter.
///
/// The runtime itself never decrements; this is public API kept for hosts.
pub async fn decr<C: ConnectionLike + Send>(
    conn: &mut C,
    keys: &Keys,
    name: &str,
    by: i64,
) -> RusqueResult<()> {
    let _: i64 = conn.decr(keys.stat(name), by).await?;
    Ok(())
}

/// Delete given counter entirely.
pub async fn clear<C: ConnectionLike + Send>(
    conn: &mut C,
    keys: &Keys,
    name: &str,
) -> RusqueResult<()> {
    let _: () = conn.del(keys.stat(name)).await?;
    Ok(())
}
