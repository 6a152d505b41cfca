//! Contains definitions for Redis keys, prefixes, counters, etc. used throughout the application.

/// Default namespace prefix when none is configured.
pub const DEFAULT_NAMESPACE: &str = "resque:";

/// Seconds a tracked status record lives for. Refreshed on every update.
pub const STATUS_TTL_SECS: usize = 24 * 60 * 60;

/// Seconds a persisted failure record lives for.
pub const FAILED_TTL_SECS: usize = 14 * 24 * 60 * 60;

/// Stat counter incremented for every cleanly completed job.
pub const PROCESSED_STAT: &str = "processed";

/// Stat counter incremented for every failed job.
pub const FAILED_STAT: &str = "failed";

/// Builds namespaced Redis keys for every record the queue system stores.
///
/// The key layout under the namespace matches the original Resque layout, so
/// existing dashboards keep working against this implementation.
#[derive(Clone, Debug)]
pub struct Keys {
    namespace: String,
}

impl Keys {
    /// Create a key builder for given namespace. A trailing `:` is appended
    /// when missing; an empty namespace falls back to the default.
    pub fn new<S: Into<String>>(namespace: S) -> Self {
        let mut namespace = namespace.into();
        if namespace.is_empty() {
            namespace = DEFAULT_NAMESPACE.to_string();
        } else if !namespace.ends_with(':') {
            namespace.push(':');
        }
        Self { namespace }
    }

    /// The configured namespace prefix, including the trailing `:`.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Set of all known queue names.
    pub fn queues(&self) -> String {
        format!("{}queues", self.namespace)
    }

    /// List of queued job envelopes for given queue.
    pub fn queue(&self, name: &str) -> String {
        format!("{}queue:{}", self.namespace, name)
    }

    /// Set of registered worker identities.
    pub fn workers(&self) -> String {
        format!("{}workers", self.namespace)
    }

    /// Record of the job a worker is currently executing.
    pub fn worker(&self, id: &str) -> String {
        format!("{}worker:{}", self.namespace, id)
    }

    /// Timestamp written when a worker registers.
    pub fn worker_started(&self, id: &str) -> String {
        format!("{}worker:{}:started", self.namespace, id)
    }

    /// Integer counter with given stat name.
    pub fn stat(&self, name: &str) -> String {
        format!("{}stat:{}", self.namespace, name)
    }

    /// Tracked status record for given job id.
    pub fn status(&self, job_id: &str) -> String {
        format!("{}job:{}:status", self.namespace, job_id)
    }

    /// Persisted failure record for given job id.
    pub fn failed(&self, job_id: &str) -> String {
        format!("{}failed:{}", self.namespace, job_id)
    }
}
