//! Checkpoint directory names.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;

/// Nanoseconds since the Unix epoch at which a checkpoint was taken.
///
/// Checkpoint directories are named by the decimal form of this value, so
/// lexical listing is irrelevant: ordering is always numeric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CheckpointId(u128);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0:?} is not a checkpoint id")]
pub struct ParseCheckpointIdError(String);

impl CheckpointId {
    pub fn from_nanos(nanos: u128) -> Self {
        Self(nanos)
    }

    pub fn as_nanos(self) -> u128 {
        self.0
    }

    /// The current time.
    pub fn now() -> Self {
        let nanos = Utc::now()
            .timestamp_nanos_opt()
            .map_or(0, |n| n.max(0) as u128);
        Self(nanos)
    }

    /// The current time, or one past `last` if the clock has not advanced.
    pub fn next_after(last: Option<CheckpointId>) -> Self {
        let now = Self::now();
        match last {
            Some(last) if last >= now => Self(last.0 + 1),
            _ => now,
        }
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CheckpointId {
    type Err = ParseCheckpointIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseCheckpointIdError(s.to_string()));
        }
        s.parse::<u128>()
            .map(Self)
            .map_err(|_| ParseCheckpointIdError(s.to_string()))
    }
}
