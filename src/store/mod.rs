//! Durable patch history and per-task runtime state.

mod patch;
mod patches;
mod state;

pub use patch::{OpKind, Operation, Patch};
pub use patches::{PatchReader, PatchStore};
pub use state::{
    EndpointState, FileStateStore, MemoryStateStore, Side, TaskState, TaskStatus,
};
