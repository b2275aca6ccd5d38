//! Deferred directory removal.
//!
//! Directories are scheduled for deletion a fixed delay into the future.
//! Disk pressure pulls deletions forward: pruning removes every entry whose
//! deadline falls within the given window from now.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Entry {
    deadline: DateTime<Utc>,
    path: PathBuf,
}

/// Priority queue of `(deadline, path)` pairs.
#[derive(Default)]
pub struct GarbageCollector {
    queue: BinaryHeap<Reverse<Entry>>,
}

impl GarbageCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules a directory for removal `delay` from now.
    pub fn schedule(&mut self, delay: Duration, path: impl Into<PathBuf>) {
        let path = path.into();
        let deadline =
            Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        debug!(path = %path.display(), %deadline, "Scheduled for garbage collection");
        self.queue.push(Reverse(Entry { deadline, path }));
    }

    /// Drops a pending entry, keeping the directory.
    pub fn unschedule(&mut self, path: &Path) -> bool {
        let before = self.queue.len();
        let entries: Vec<_> = std::mem::take(&mut self.queue)
            .into_iter()
            .filter(|Reverse(e)| e.path != path)
            .collect();
        self.queue = entries.into();
        before != self.queue.len()
    }

    /// Number of pending entries.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Entries whose deadline falls within `window` from now, removed from
    /// the queue. Callers delete the returned paths.
    pub fn take_due(&mut self, window: Duration) -> Vec<PathBuf> {
        let cutoff =
            Utc::now() + chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());
        let mut due = Vec::new();

        while let Some(Reverse(entry)) = self.queue.peek() {
            if entry.deadline > cutoff {
                break;
            }
            let Reverse(entry) = self.queue.pop().expect("peeked entry");
            due.push(entry.path);
        }

        due
    }

    /// Removes every directory due within `window`.
    pub async fn prune(&mut self, window: Duration) {
        let due = self.take_due(window);
        if due.is_empty() {
            return;
        }

        info!(count = due.len(), "Pruning garbage-collected directories");
        for path in due {
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => debug!(path = %path.display(), "Removed directory"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove directory"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_due_window() {
        let mut gc = GarbageCollector::new();
        gc.schedule(Duration::from_secs(60), "/tmp/soon");
        gc.schedule(Duration::from_secs(3600), "/tmp/later");

        // A narrow window takes nothing.
        assert!(gc.take_due(Duration::from_secs(1)).is_empty());
        assert_eq!(gc.pending(), 2);

        // A window past the first deadline takes only it.
        let due = gc.take_due(Duration::from_secs(120));
        assert_eq!(due, vec![PathBuf::from("/tmp/soon")]);
        assert_eq!(gc.pending(), 1);
    }

    #[test]
    fn test_take_due_orders_by_deadline() {
        let mut gc = GarbageCollector::new();
        gc.schedule(Duration::from_secs(30), "/tmp/b");
        gc.schedule(Duration::from_secs(10), "/tmp/a");
        gc.schedule(Duration::from_secs(20), "/tmp/c");

        let due = gc.take_due(Duration::from_secs(60));
        assert_eq!(
            due,
            vec![
                PathBuf::from("/tmp/a"),
                PathBuf::from("/tmp/c"),
                PathBuf::from("/tmp/b"),
            ]
        );
    }

    #[test]
    fn test_unschedule() {
        let mut gc = GarbageCollector::new();
        gc.schedule(Duration::from_secs(10), "/tmp/keep");
        gc.schedule(Duration::from_secs(10), "/tmp/drop");

        assert!(gc.unschedule(Path::new("/tmp/drop")));
        assert!(!gc.unschedule(Path::new("/tmp/missing")));

        let due = gc.take_due(Duration::from_secs(60));
        assert_eq!(due, vec![PathBuf::from("/tmp/keep")]);
    }

    #[tokio::test]
    async fn test_prune_removes_directories() {
        let dir = tempfile::tempdir().unwrap();
        let victim = dir.path().join("victim");
        std::fs::create_dir_all(victim.join("nested")).unwrap();

        let mut gc = GarbageCollector::new();
        gc.schedule(Duration::from_secs(0), &victim);
        gc.prune(Duration::from_secs(1)).await;

        assert!(!victim.exists());
        assert_eq!(gc.pending(), 0);
    }
}
