//! Truncate operation.

use super::state::{Operation, OperationState, OperationType};

/// Drops all data in the tablet. Replicated like any other operation so
/// every replica truncates at the same point in the log.
pub struct TruncateOperation {
    state: OperationState,
}

impl TruncateOperation {
    pub fn new(state: OperationState) -> Self {
        Self { state }
    }
}

impl Operation for TruncateOperation {
    fn state(&self) -> &OperationState {
        &self.state
    }

    fn op_type(&self) -> OperationType {
        OperationType::Truncate
    }
}
