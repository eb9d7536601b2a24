//! Stage-scoped single-flight guard.

use tokio::sync::{Mutex, MutexGuard};

use crate::pipeline::Stage;

/// One async mutex per stage. A run holds its stage's guard from start to finish,
/// so same-stage triggers queue up in FIFO order while different stages proceed
/// independently.
#[derive(Debug, Default)]
pub struct StageGuards {
    ingest: Mutex<()>,
    backfill: Mutex<()>,
    dispatch: Mutex<()>,
}

impl StageGuards {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex(&self, stage: Stage) -> &Mutex<()> {
        match stage {
            Stage::IngestOrders => &self.ingest,
            Stage::BackfillDetails => &self.backfill,
            Stage::DispatchNotifications => &self.dispatch,
        }
    }

    /// Waits until no other run of `stage` is in flight.
    pub async fn acquire(&self, stage: Stage) -> MutexGuard<'_, ()> {
        self.mutex(stage).lock().await
    }

    #[must_use]
    pub fn is_running(&self, stage: Stage) -> bool {
        self.mutex(stage).try_lock().is_err()
    }
}
