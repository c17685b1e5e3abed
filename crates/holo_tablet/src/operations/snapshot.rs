//! Snapshot operation.

use super::state::{Operation, OperationState, OperationType};

/// Marks a consistent snapshot point in the replicated log. The storage
/// engine decides what to capture when the marker applies.
pub struct SnapshotOperation {
    state: OperationState,
}

impl SnapshotOperation {
    pub fn new(state: OperationState) -> Self {
        Self { state }
    }
}

impl Operation for SnapshotOperation {
    fn state(&self) -> &OperationState {
        &self.state
    }

    fn op_type(&self) -> OperationType {
        OperationType::Snapshot
    }
}
