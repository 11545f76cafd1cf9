use crate::models::{JobId, PartitionId};
use crate::state_machine::{DistributedStateMachine, StateDelta, StateMachineError};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One state machine per partition
#[derive(Debug, Default)]
pub struct StateRegistry {
    machines: BTreeMap<PartitionId, Arc<DistributedStateMachine>>,
}

impl StateRegistry {
    pub fn new(partition_ids: impl IntoIterator<Item = PartitionId>) -> Self {
        Self {
            machines: partition_ids
                .into_iter()
                .map(|id| (id, Arc::new(DistributedStateMachine::new(id))))
                .collect(),
        }
    }

    pub fn machine(&self, partition_id: PartitionId) -> Result<Arc<DistributedStateMachine>, StateMachineError> {
        self.machines
            .get(&partition_id)
            .cloned()
            .ok_or(StateMachineError::UnknownPartition { partition_id })
    }

    pub fn update_state(
        &self,
        partition_id: PartitionId,
        job_id: &str,
        delta: &StateDelta,
    ) -> Result<bool, StateMachineError> {
        Ok(self.machine(partition_id)?.apply_delta(job_id, delta))
    }

    /// Drop a finished job's projection everywhere
    pub fn remove_job(&self, job_id: &JobId) {
        for machine in self.machines.values() {
            machine.remove(job_id);
        }
    }

    pub fn partition_ids(&self) -> impl Iterator<Item = PartitionId> + '_ {
        self.machines.keys().copied()
    }
}
