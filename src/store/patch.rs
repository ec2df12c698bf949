//! Patch and operation data model.
//!
//! A patch is a named, timestamped, ordered list of operations representing
//! one completed reconciliation pass between two endpoints for one task.
//! Patches are immutable once persisted except for wholesale replacement
//! under the same identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of a single change applied to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Create,
    Update,
    Delete,
    Move,
}

/// One create/update/delete/move action on a path within a patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// What happened.
    pub kind: OpKind,
    /// Path the operation applies to.
    pub path: String,
    /// Destination path, set only for [`OpKind::Move`].
    pub target: Option<String>,
    /// Entry size in bytes after the operation.
    pub size: u64,
    /// Modification time recorded by the engine, if known.
    pub mtime: Option<DateTime<Utc>>,
    /// Content hash recorded by the engine, if computed.
    pub hash: Option<String>,
}

impl Operation {
    /// Operation with only the fields every engine knows.
    pub fn new(kind: OpKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            target: None,
            size: 0,
            mtime: None,
            hash: None,
        }
    }
}

/// One completed reconciliation pass for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patch {
    /// Patch identity; re-running a pass with the same id replaces the
    /// previously stored contents, never appends to them.
    pub id: String,
    /// Task this patch belongs to.
    pub task: String,
    /// Source endpoint URI of the pass.
    pub source: String,
    /// Target endpoint URI of the pass.
    pub target: String,
    /// When the pass completed.
    pub at: DateTime<Utc>,
    /// Ordered operations applied by the pass.
    pub ops: Vec<Operation>,
}

impl Patch {
    /// New empty patch stamped with the current time.
    pub fn new(
        id: impl Into<String>,
        task: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            task: task.into(),
            source: source.into(),
            target: target.into(),
            at: Utc::now(),
            ops: Vec::new(),
        }
    }

    /// True when the pass produced no operations; such patches are never
    /// persisted.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
