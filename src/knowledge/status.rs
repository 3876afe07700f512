//! Lifecycle states for knowledge files and the transitions allowed between them.
//!
//! ```text
//! PENDING -> UPLOADING -> COMPLETED -> PROCESSING -> VECTORIZED
//!                 \            \            \
//!                  +------------+------------+--> FAILED
//! ```
//!
//! `FAILED` and `VECTORIZED` are terminal for the pipeline. Outside the lifecycle, an operator
//! may requeue a FAILED file, or one stuck in PROCESSING after a crash, back to COMPLETED; see
//! [`FileStatus::can_requeue`]. Statuses serialize as lowercase strings, which is also how they
//! are stored in the metadata database.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Processing state of a knowledge file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    /// Record created; no upload credential issued yet.
    Pending,
    /// Upload credentials issued; bytes may be in flight.
    Uploading,
    /// Bytes durably stored in the object store.
    Completed,
    /// Vectorization currently running.
    Processing,
    /// Vectors written to the vector store.
    Vectorized,
    /// Upload or processing failed; see the recorded failure reason.
    Failed,
}

impl FileStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [FileStatus; 6] = [
        FileStatus::Pending,
        FileStatus::Uploading,
        FileStatus::Completed,
        FileStatus::Processing,
        FileStatus::Vectorized,
        FileStatus::Failed,
    ];

    /// Lowercase wire and storage representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Uploading => "uploading",
            FileStatus::Completed => "completed",
            FileStatus::Processing => "processing",
            FileStatus::Vectorized => "vectorized",
            FileStatus::Failed => "failed",
        }
    }

    /// Whether moving from `self` to `next` is a legal lifecycle step.
    pub const fn can_transition_to(self, next: FileStatus) -> bool {
        matches!(
            (self, next),
            (FileStatus::Pending, FileStatus::Uploading)
                | (FileStatus::Uploading, FileStatus::Completed)
                | (FileStatus::Uploading, FileStatus::Failed)
                | (FileStatus::Completed, FileStatus::Processing)
                | (FileStatus::Completed, FileStatus::Failed)
                | (FileStatus::Processing, FileStatus::Vectorized)
                | (FileStatus::Processing, FileStatus::Failed)
        )
    }

    /// Whether an operator may reset this status to COMPLETED for another pipeline run.
    pub const fn can_requeue(self) -> bool {
        matches!(self, FileStatus::Failed | FileStatus::Processing)
    }

    /// No further lifecycle transitions are possible from a terminal status.
    pub const fn is_terminal(self) -> bool {
        matches!(self, FileStatus::Vectorized | FileStatus::Failed)
    }

    /// The stored bytes are known to be complete (finalize already succeeded).
    pub const fn is_upload_settled(self) -> bool {
        matches!(
            self,
            FileStatus::Completed | FileStatus::Processing | FileStatus::Vectorized
        )
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when a stored status string does not name a known status.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown file status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for FileStatus {
    type Err = UnknownStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        FileStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| UnknownStatus(value.to_string()))
    }
}
