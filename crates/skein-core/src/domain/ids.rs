//! Task identifiers.
//!
//! Task ids are plain strings because callers may supply their own (for example a
//! reminder id derived from a chat message). Generated ids are ULID based, carry a
//! `task-` prefix and sort by creation time.

use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

const GENERATED_PREFIX: &str = "task-";

/// Primary key of a task row. Every occurrence of a recurring series gets its own id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Builds the canonical generated form, `task-<ULID>`.
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(format!("{GENERATED_PREFIX}{ulid}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The ULID part of a generated id, if this id was generated.
    pub fn as_ulid(&self) -> Option<Ulid> {
        self.0
            .strip_prefix(GENERATED_PREFIX)
            .and_then(|raw| Ulid::from_string(raw).ok())
    }
}

impl From<Ulid> for TaskId {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}
