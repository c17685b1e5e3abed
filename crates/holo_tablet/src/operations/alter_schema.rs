//! Schema-change operation.

use anyhow::Result;

use super::state::{Operation, OperationState, OperationType};

/// Alters the tablet schema. Version checks happen inside the storage
/// engine's prepare hook, so a stale request fails before it ever reaches
/// consensus.
pub struct AlterSchemaOperation {
    state: OperationState,
}

impl AlterSchemaOperation {
    pub fn new(state: OperationState) -> Self {
        Self { state }
    }
}

impl Operation for AlterSchemaOperation {
    fn state(&self) -> &OperationState {
        &self.state
    }

    fn op_type(&self) -> OperationType {
        OperationType::AlterSchema
    }

    fn prepare(&self) -> Result<()> {
        tracing::info!(
            tablet = %self.state.tablet().tablet_id(),
            request_len = self.state.request().len(),
            "preparing schema change"
        );
        self.state
            .tablet()
            .prepare_operation(self.op_type(), self.state.request())
    }
}
