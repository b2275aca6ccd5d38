//! Registry of paths exposed for browsing.
//!
//! Executor sandboxes and the agent log are attached here; the state
//! snapshot lists them so operators can find their way to the bits on disk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

#[derive(Default)]
pub struct Files {
    attached: BTreeMap<String, PathBuf>,
}

impl Files {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exposes `path` under the given virtual name.
    pub fn attach(&mut self, name: impl Into<String>, path: impl Into<PathBuf>) {
        let name = name.into();
        let path = path.into();
        info!(name = %name, path = %path.display(), "Attached file");
        self.attached.insert(name, path);
    }

    /// Stops exposing a path.
    pub fn detach(&mut self, name: &str) {
        if self.attached.remove(name).is_some() {
            debug!(name = %name, "Detached file");
        }
    }

    pub fn get(&self, name: &str) -> Option<&Path> {
        self.attached.get(name).map(PathBuf::as_path)
    }

    /// Everything attached, for the state snapshot.
    pub fn list(&self) -> Vec<(String, PathBuf)> {
        self.attached
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_detach() {
        let mut files = Files::new();
        files.attach("/agent/log", "/var/log/skiff-agent.log");
        assert_eq!(
            files.get("/agent/log"),
            Some(Path::new("/var/log/skiff-agent.log"))
        );

        files.detach("/agent/log");
        assert!(files.get("/agent/log").is_none());
        assert!(files.list().is_empty());
    }
}
