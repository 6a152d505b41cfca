//! Defines the core queue/job application logic built on Redis.

pub mod failure;
pub mod job;
pub mod keys;
pub mod queue;
pub mod stat;
pub mod status;
pub mod worker;

pub use self::job::Job;
pub use self::keys::Keys;
pub use self::queue::{MatchSpec, Queue};
pub use self::worker::Worker;
