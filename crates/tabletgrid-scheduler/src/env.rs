//! Collaborator handles shared by the engine and balance strategies.

use std::sync::Arc;

use tabletgrid_core::{Clock, SystemClock};
use tabletgrid_state::{Catalog, ClusterInfo, EditLog, TransactionManager};

use crate::task::TaskDispatcher;

#[derive(Clone)]
pub struct SchedEnv {
    pub catalog: Arc<dyn Catalog>,
    pub cluster: Arc<dyn ClusterInfo>,
    pub txn_manager: Arc<dyn TransactionManager>,
    pub edit_log: Arc<dyn EditLog>,
    pub dispatcher: Arc<dyn TaskDispatcher>,
    pub clock: Arc<dyn Clock>,
}

impl SchedEnv {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        cluster: Arc<dyn ClusterInfo>,
        txn_manager: Arc<dyn TransactionManager>,
        edit_log: Arc<dyn EditLog>,
        dispatcher: Arc<dyn TaskDispatcher>,
    ) -> Self {
        Self {
            catalog,
            cluster,
            txn_manager,
            edit_log,
            dispatcher,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }
}
