//! Durable checkpoint primitives.
//!
//! Single-value files are written atomically: serialize to a temporary
//! sibling, fsync, rename over the destination. The per-task `updates` file
//! is an append-only JSONL log of update and acknowledgement records.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use skiff_id::UpdateId;
use skiff_messages::StatusUpdate;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint codec failure at {path}: {source}")]
    Codec {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> CheckpointError + '_ {
    move |source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// One line in a task's `updates` log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum UpdateRecord {
    Update { update: StatusUpdate },
    Ack { update_id: UpdateId },
}

/// Atomically writes a serde value as JSON.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), CheckpointError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err(path))?;
    }

    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp).map_err(io_err(&tmp))?;
        let body = serde_json::to_vec_pretty(value).map_err(|source| CheckpointError::Codec {
            path: path.to_path_buf(),
            source,
        })?;
        file.write_all(&body).map_err(io_err(&tmp))?;
        file.sync_all().map_err(io_err(&tmp))?;
    }
    fs::rename(&tmp, path).map_err(io_err(path))?;

    Ok(())
}

/// Reads a JSON value written by [`write_json`].
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, CheckpointError> {
    let body = fs::read(path).map_err(io_err(path))?;
    serde_json::from_slice(&body).map_err(|source| CheckpointError::Codec {
        path: path.to_path_buf(),
        source,
    })
}

/// Appends one record to an updates log, synchronously.
pub fn append_record(path: &Path, record: &UpdateRecord) -> Result<(), CheckpointError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err(path))?;
    }

    let mut line = serde_json::to_vec(record).map_err(|source| CheckpointError::Codec {
        path: path.to_path_buf(),
        source,
    })?;
    line.push(b'\n');

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_err(path))?;
    file.write_all(&line).map_err(io_err(path))?;
    file.sync_data().map_err(io_err(path))?;

    Ok(())
}

/// Reads back an updates log in order. A trailing torn line (crash during
/// append) is tolerated and dropped; corruption earlier in the log is not.
pub fn read_records(path: &Path) -> Result<Vec<UpdateRecord>, CheckpointError> {
    let file = File::open(path).map_err(io_err(path))?;
    let reader = BufReader::new(file);

    let mut records = Vec::new();
    let mut lines = reader.lines().peekable();
    while let Some(line) = lines.next() {
        let line = line.map_err(io_err(path))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(record) => records.push(record),
            Err(source) if lines.peek().is_none() => {
                tracing::warn!(path = %path.display(), error = %source, "dropping torn trailing record");
            }
            Err(source) => {
                return Err(CheckpointError::Codec {
                    path: path.to_path_buf(),
                    source,
                });
            }
        }
    }

    Ok(records)
}

/// Atomically writes a pointer file (e.g. `runs/latest`).
pub fn write_pointer(path: &Path, target: &str) -> Result<(), CheckpointError> {
    write_json(path, &target.to_string())
}

/// Reads a pointer file.
pub fn read_pointer(path: &Path) -> Result<String, CheckpointError> {
    read_json(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_messages::TaskState;

    fn sample_update() -> StatusUpdate {
        StatusUpdate::new(
            "f1".parse().unwrap(),
            Some("a1".parse().unwrap()),
            "t1".parse().unwrap(),
            TaskState::Running,
            "",
        )
    }

    #[test]
    fn test_write_read_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("value.info");

        write_json(&path, &42u32).unwrap();
        let back: u32 = read_json(&path).unwrap();
        assert_eq!(back, 42);

        // Overwrite is atomic and replaces the value.
        write_json(&path, &7u32).unwrap();
        let back: u32 = read_json(&path).unwrap();
        assert_eq!(back, 7);
    }

    #[test]
    fn test_append_and_read_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("updates");

        let update = sample_update();
        append_record(&path, &UpdateRecord::Update { update: update.clone() }).unwrap();
        append_record(
            &path,
            &UpdateRecord::Ack {
                update_id: update.update_id,
            },
        )
        .unwrap();

        let records = read_records(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert!(matches!(records[0], UpdateRecord::Update { .. }));
        assert!(matches!(records[1], UpdateRecord::Ack { .. }));
    }

    #[test]
    fn test_torn_trailing_record_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("updates");

        append_record(
            &path,
            &UpdateRecord::Update {
                update: sample_update(),
            },
        )
        .unwrap();

        // Simulate a crash mid-append.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"record\":\"upd").unwrap();
        drop(file);

        let records = read_records(&path).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_pointer_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs").join("latest");

        let run = skiff_id::RunId::new();
        write_pointer(&path, &run.to_string()).unwrap();
        assert_eq!(read_pointer(&path).unwrap(), run.to_string());
    }
}
