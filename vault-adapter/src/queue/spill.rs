//! On-disk spill file for queue entries still pending at shutdown.
//!
//! Format: `{"version": 1, "written_at": .., "operations": [QueuedOperation, ..]}`, written
//! to a temp file in the same directory and renamed into place.

use super::QueuedOperation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::Path;

const SPILL_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct SpillFile {
    version: u32,
    written_at: DateTime<Utc>,
    operations: Vec<QueuedOperation>,
}

pub fn write_spill(path: &Path, operations: &[QueuedOperation]) -> io::Result<()> {
    let file = SpillFile {
        version: SPILL_VERSION,
        written_at: Utc::now(),
        operations: operations.to_vec(),
    };
    let data = serde_json::to_vec_pretty(&file)?;

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    fs::create_dir_all(&dir)?;
    let tmp = dir.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(&data)?;
        f.sync_all()?;
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

/// `Ok(None)` when no spill file exists.
pub fn read_spill(path: &Path) -> io::Result<Option<Vec<QueuedOperation>>> {
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let file: SpillFile = serde_json::from_slice(&content)?;
    if file.version != SPILL_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported spill file version {}", file.version),
        ));
    }
    Ok(Some(file.operations))
}

pub fn remove_spill(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
