//! Per-job collaborators handed to the coordinator.

use crate::data::ShardPrefetcher;
use crate::dist::Collective;
use crate::sync::GradientSynchronizer;
use crate::telemetry::TelemetrySink;

/// Everything a rank needs besides the model and the configuration.
pub struct JobContext {
    pub collective: Box<dyn Collective>,
    pub prefetcher: ShardPrefetcher,
    pub synchronizer: GradientSynchronizer,
    pub telemetry: Box<dyn TelemetrySink>,
}

impl JobContext {
    pub fn new(
        collective: Box<dyn Collective>,
        prefetcher: ShardPrefetcher,
        synchronizer: GradientSynchronizer,
        telemetry: Box<dyn TelemetrySink>,
    ) -> Self {
        Self {
            collective,
            prefetcher,
            synchronizer,
            telemetry,
        }
    }

    pub fn rank(&self) -> usize {
        self.collective.rank()
    }

    pub fn world_size(&self) -> usize {
        self.collective.world_size()
    }

    pub fn is_main(&self) -> bool {
        self.collective.is_main()
    }

    /// Run one accumulation boundary against this job's collective.
    pub fn synchronize(&mut self) -> crate::error::JobResult<crate::sync::SyncOutcome> {
        self.synchronizer.step(self.collective.as_mut())
    }
}
