//! Shared helpers for integration tests.
//!
//! Tests run against a real Redis on 127.0.0.1:6379, using database 7 under
//! the `testResque` namespace. The database is shared, so tests take a
//! process-wide lock and flush it before running.

use std::sync::{Arc, OnceLock};

use redis::aio::MultiplexedConnection;
use tokio::sync::{Mutex, OwnedMutexGuard};

use rusque::application::Keys;
use rusque::config::Config;
use rusque::Context;

const TEST_NAMESPACE: &str = "testResque";
const TEST_DATABASE: i64 = 7;

static DB_LOCK: OnceLock<Arc<Mutex<()>>> = OnceLock::new();

/// Holds the test database lock for the duration of a test.
pub struct TestGuard {
    _guard: OwnedMutexGuard<()>,
}

/// Configuration pointing at the test database.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.redis.server = "127.0.0.1:6379".to_string();
    config.redis.database = TEST_DATABASE;
    config.redis.namespace = TEST_NAMESPACE.to_string();
    config
}

/// Key builder matching the test namespace.
pub fn test_keys() -> Keys {
    Keys::new(TEST_NAMESPACE)
}

/// Open a raw connection to the test database, for asserting on keys
/// directly.
pub async fn raw_conn() -> MultiplexedConnection {
    let config = test_config();
    let client = redis::Client::open(config.redis.url().as_str()).unwrap();
    client
        .get_multiplexed_tokio_connection()
        .await
        .expect("integration tests require a Redis server on 127.0.0.1:6379")
}

/// Take the test database lock, flush the database, and build a fresh
/// context. The context's handler registry is empty; tests populate it
/// before wrapping the context in an `Arc`.
pub async fn init() -> (TestGuard, Context) {
    let lock = DB_LOCK.get_or_init(|| Arc::new(Mutex::new(()))).clone();
    let guard = lock.lock_owned().await;

    let mut conn = raw_conn().await;
    let _: () = redis::cmd("FLUSHDB").query_async(&mut conn).await.unwrap();

    let context = Context::new(test_config()).unwrap();
    (TestGuard { _guard: guard }, context)
}
