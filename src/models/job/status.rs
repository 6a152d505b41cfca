//! Defines the tracked lifecycle status of a job.

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

const WAITING_STATUS: &str = "waiting";
const RUNNING_STATUS: &str = "running";
const FAILED_STATUS: &str = "failed";
const COMPLETE_STATUS: &str = "complete";

/// Status of a tracked job. Stored on the wire as the integer codes used by
/// the original Resque status records.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Status {
    /// Job has been enqueued, waiting for a worker to reserve it.
    Waiting,

    /// Job is currently being executed by a worker.
    Running,

    /// Job execution ended in failure.
    Failed,

    /// Job execution completed successfully.
    Complete,
}

impl Status {
    /// Wire code of this status.
    pub fn code(self) -> u8 {
        match self {
            Status::Waiting => 1,
            Status::Running => 2,
            Status::Failed => 3,
            Status::Complete => 4,
        }
    }

    /// Map a wire code back to a status.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Status::Waiting),
            2 => Some(Status::Running),
            3 => Some(Status::Failed),
            4 => Some(Status::Complete),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

impl AsRef<str> for Status {
    fn as_ref(&self) -> &str {
        match self {
            Status::Waiting => WAITING_STATUS,
            Status::Running => RUNNING_STATUS,
            Status::Failed => FAILED_STATUS,
            Status::Complete => COMPLETE_STATUS,
        }
    }
}

impl FromStr for Status {
    type Err = ();

    fn from_str(s: &str) -> Result<Status, ()> {
        match s {
            WAITING_STATUS => Ok(Status::Waiting),
            RUNNING_STATUS => Ok(Status::Running),
            FAILED_STATUS => Ok(Status::Failed),
            COMPLETE_STATUS => Ok(Status::Complete),
            _ => Err(()),
        }
    }
}

impl Serialize for Status {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        Status::from_code(code)
            .ok_or_else(|| de::Error::custom(format!("invalid status code: {}", code)))
    }
}
