//! Operation variants driven through the tablet peer.
//!
//! `state` holds the shared per-operation record and the `Operation`
//! contract; the sibling modules implement one variant each. Safe-time-only
//! updates have no variant here: they are drivers without an operation.

mod alter_schema;
mod snapshot;
mod state;
mod truncate;
mod update_txn;
mod write;

#[cfg(test)]
pub(crate) use state::tests_support;

pub use alter_schema::AlterSchemaOperation;
pub use snapshot::SnapshotOperation;
pub use state::{CompletionCallback, Operation, OperationState, OperationType};
pub use truncate::TruncateOperation;
pub use update_txn::UpdateTxnOperation;
pub use write::WriteOperation;
