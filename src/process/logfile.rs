//! Per-instance process log files.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead as _, BufReader, Write as _};
use std::path::Path;

use crate::error::Result;

/// Truncate the log, write a timestamped header, and return handles for stdout and stderr.
pub(super) fn open_fresh(path: &Path, label: &str) -> Result<(File, File)> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    writeln!(
        file,
        "===== {} started at {} =====",
        label,
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f")
    )?;
    file.flush()?;

    let stderr = file.try_clone()?;
    Ok((file, stderr))
}

/// Last `lines` lines of a log file. A missing file yields an empty tail.
pub fn read_log_tail(path: &Path, lines: usize) -> Result<Vec<String>> {
    if lines == 0 {
        return Ok(Vec::new());
    }
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut tail = VecDeque::with_capacity(lines);
    for line in BufReader::new(file).split(b'\n') {
        let line = line?;
        if tail.len() == lines {
            tail.pop_front();
        }
        tail.push_back(String::from_utf8_lossy(&line).trim_end_matches('\r').to_string());
    }
    Ok(tail.into())
}

/// Best-effort tail for error payloads.
pub(super) fn tail_or_empty(path: &Path) -> Vec<String> {
    read_log_tail(path, super::LOG_TAIL_LINES).unwrap_or_else(|e| {
        log::debug!("Could not read log tail {:?}: {}", path, e);
        Vec::new()
    })
}

/// Empty a log file, keeping it in place.
pub fn clear_log(path: &Path) -> Result<()> {
    if path.exists() {
        File::create(path)?;
    }
    Ok(())
}
