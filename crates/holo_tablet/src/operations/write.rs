//! Client write operation.

use std::time::Instant;

use anyhow::{bail, Result};

use super::state::{Operation, OperationState, OperationType};

/// A leader-submitted (or replicated) row write. Leader writes carry the
/// caller's deadline; a write whose deadline has already passed fails in
/// prepare and is surfaced through the completion callback, never as a
/// driver-level error.
pub struct WriteOperation {
    state: OperationState,
    deadline: Option<Instant>,
}

impl WriteOperation {
    pub fn new(state: OperationState, deadline: Option<Instant>) -> Self {
        Self { state, deadline }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

impl Operation for WriteOperation {
    fn state(&self) -> &OperationState {
        &self.state
    }

    fn op_type(&self) -> OperationType {
        OperationType::Write
    }

    fn prepare(&self) -> Result<()> {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                bail!(
                    "write deadline exceeded before prepare ({} byte request)",
                    self.state.request().len()
                );
            }
        }
        self.state
            .tablet()
            .prepare_operation(self.op_type(), self.state.request())
    }
}
