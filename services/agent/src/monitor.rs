//! Per-executor monitoring registry.
//!
//! The sampling itself belongs to the resource-monitor collaborator; the
//! agent only tracks which executors should be watched and at what cadence.

use std::collections::HashSet;
use std::time::Duration;

use skiff_id::{ExecutorId, FrameworkId};
use tracing::{debug, warn};

#[derive(Default)]
pub struct ResourceMonitor {
    watched: HashSet<(FrameworkId, ExecutorId)>,
}

impl ResourceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watch(
        &mut self,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        interval: Duration,
    ) {
        debug!(
            framework_id = %framework_id,
            executor_id = %executor_id,
            interval_secs = interval.as_secs_f64(),
            "Watching executor"
        );
        if !self.watched.insert((framework_id.clone(), executor_id.clone())) {
            warn!(
                framework_id = %framework_id,
                executor_id = %executor_id,
                "Executor already watched"
            );
        }
    }

    pub fn unwatch(&mut self, framework_id: &FrameworkId, executor_id: &ExecutorId) {
        if !self
            .watched
            .remove(&(framework_id.clone(), executor_id.clone()))
        {
            debug!(
                framework_id = %framework_id,
                executor_id = %executor_id,
                "Executor was not watched"
            );
        }
    }

    pub fn is_watching(&self, framework_id: &FrameworkId, executor_id: &ExecutorId) -> bool {
        self.watched
            .contains(&(framework_id.clone(), executor_id.clone()))
    }

    pub fn watched_count(&self) -> usize {
        self.watched.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_unwatch() {
        let mut monitor = ResourceMonitor::new();
        let fid: FrameworkId = "f1".parse().unwrap();
        let eid: ExecutorId = "e1".parse().unwrap();

        monitor.watch(fid.clone(), eid.clone(), Duration::from_secs(1));
        assert!(monitor.is_watching(&fid, &eid));
        assert_eq!(monitor.watched_count(), 1);

        monitor.unwatch(&fid, &eid);
        assert!(!monitor.is_watching(&fid, &eid));

        // Unwatching twice is harmless.
        monitor.unwatch(&fid, &eid);
    }
}
