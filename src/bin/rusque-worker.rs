//! Main executable that runs one or more workers.
//!
//! Configuration comes from an optional TOML file plus the environment
//! variable surface (`QUEUE`, `COUNT`, `INTERVAL`, `REDIS_BACKEND`,
//! `REDIS_DATABASE`, `REDIS_NAMESPACE`, `PREFIX`, `LOGGING`).
//!
//! Handlers are registered by hosts that embed the library in their own
//! binary; this launcher starts with an empty registry, so any reserved job
//! is recorded as failed with an unknown handler class. It is primarily
//! useful for draining queues, exercising deployments and supervising
//! multi-process setups.

use std::sync::Arc;

use log::{error, info};

use rusque::config;
use rusque::{Context, Worker};

#[tokio::main]
async fn main() {
    let config = config::parse_config_from_cli_args();

    env_logger::Builder::new()
        .parse_filters(config.worker.logging.filter())
        .init();

    if config.worker.queues.is_empty() {
        eprintln!("No queues configured, set QUEUE (e.g. QUEUE=high,low or QUEUE=*)");
        std::process::exit(1);
    }

    if config.worker.count > 1 {
        supervise(config.worker.count).await;
        return;
    }

    let queues = config.worker.queues.clone();
    let interval = config.worker.interval;
    let context = match Context::new(config) {
        Ok(context) => Arc::new(context),
        Err(err) => {
            eprintln!("Failed to initialise Redis client: {}", err);
            std::process::exit(1);
        }
    };

    let mut worker = match Worker::new(context, queues) {
        Ok(worker) => worker,
        Err(err) => {
            eprintln!("Failed to construct worker: {}", err);
            std::process::exit(1);
        }
    };

    info!("rusque-worker {} starting as {}", rusque::VERSION, worker.id());
    if let Err(err) = worker.work(interval).await {
        error!("Worker exited with error: {}", err);
        std::process::exit(1);
    }
}

/// Start `count` single-worker copies of this binary and wait for them all,
/// so each worker keeps a truthful `<host>:<pid>:<queues>` identity.
async fn supervise(count: usize) {
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(err) => {
            eprintln!("Failed to locate worker executable: {}", err);
            std::process::exit(1);
        }
    };

    let args: Vec<std::ffi::OsString> = std::env::args_os().skip(1).collect();
    let mut children = Vec::with_capacity(count);
    for n in 0..count {
        match tokio::process::Command::new(&exe)
            .args(&args)
            .env("COUNT", "1")
            .spawn()
        {
            Ok(child) => children.push(child),
            Err(err) => {
                eprintln!("Failed to spawn worker {}: {}", n, err);
                std::process::exit(1);
            }
        }
    }
    info!("Supervising {} workers", children.len());

    let mut failed = false;
    for mut child in children {
        match child.wait().await {
            Ok(status) if status.success() => {}
            Ok(status) => {
                error!("Worker exited with status {}", status);
                failed = true;
            }
            Err(err) => {
                error!("Failed waiting for worker: {}", err);
                failed = true;
            }
        }
    }
    if failed {
        std::process::exit(1);
    }
}
