//! Transaction-status update operation.

use super::state::{Operation, OperationState, OperationType};

/// Advances the status record of a distributed transaction (commit, abort,
/// heartbeat). The payload is the coordinator's status message; storage
/// interprets it on apply.
pub struct UpdateTxnOperation {
    state: OperationState,
}

impl UpdateTxnOperation {
    pub fn new(state: OperationState) -> Self {
        Self { state }
    }
}

impl Operation for UpdateTxnOperation {
    fn state(&self) -> &OperationState {
        &self.state
    }

    fn op_type(&self) -> OperationType {
        OperationType::UpdateTransaction
    }
}
