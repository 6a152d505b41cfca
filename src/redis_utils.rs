//! Redis connection handling utilities.

use log::{debug, warn};
use redis::aio::MultiplexedConnection;

use crate::config::RedisConfig;
use crate::models::{RusqueError, RusqueResult};

/// Owns the single Redis connection used by a process (or by a job's child
/// execution, which opens its own).
///
/// The connection is opened lazily and is checked against the process id it
/// was opened under before every use, so that a process copy never reuses a
/// socket inherited from its parent.
pub struct RedisHandle {
    client: redis::Client,
    conn: Option<MultiplexedConnection>,
    opened_by: u32,
}

impl RedisHandle {
    /// Create a new handle from given Redis configuration. No connection is
    /// opened until the first operation.
    pub fn new(config: &RedisConfig) -> RusqueResult<Self> {
        let url = config.url();
        let client = redis::Client::open(url.as_str())
            .map_err(|err| RusqueError::Connection(err.to_string()))?;
        Ok(Self {
            client,
            conn: None,
            opened_by: std::process::id(),
        })
    }

    /// Get the live connection, opening or reopening it as necessary.
    pub async fn conn(&mut self) -> RusqueResult<&mut MultiplexedConnection> {
        let pid = std::process::id();
        if pid != self.opened_by && self.conn.is_some() {
            warn!("Process id changed since connection was opened, discarding it");
            self.conn = None;
        }

        if self.conn.is_none() {
            debug!("Opening Redis connection");
            let conn = self
                .client
                .get_multiplexed_tokio_connection()
                .await
                .map_err(|err| RusqueError::Connection(err.to_string()))?;
            self.conn = Some(conn);
            self.opened_by = pid;
        }

        Ok(self.conn.as_mut().unwrap())
    }

    /// Discard the current connection and establish a fresh one.
    ///
    /// Invoked by the worker's SIGPIPE handling after the peer closed the
    /// socket underneath us.
    pub async fn reconnect(&mut self) -> RusqueResult<()> {
        self.conn = None;
        self.conn().await?;
        Ok(())
    }
}
