// src/types.rs
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Lifecycle of a [`Reader`](crate::Reader).
///
/// `Closed` is both the initial and the terminal state; resuming a paused
/// reader puts it back into `Started`.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum ReaderState {
    Closed,
    Started,
    Paused,
}

impl fmt::Display for ReaderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReaderState::Closed => "closed",
            ReaderState::Started => "started",
            ReaderState::Paused => "paused",
        };
        f.write_str(name)
    }
}

// Where the sample buffer lives
#[derive(PartialEq, Eq, Clone, Debug, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BufferBacking {
    /// Private anonymous mapping.
    #[default]
    Anonymous,
    /// Named file mapping other processes can attach to. Without a path the
    /// file is created under the shared-memory directory using the reader name.
    Shared { path: Option<PathBuf> },
}
