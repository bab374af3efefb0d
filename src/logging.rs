//! Per-service log sinks.
//!
//! Supervised processes do not share the supervisor's stdio. Each record
//! declares where its output goes: a file (rotated per the global policy),
//! the console, syslog (handed to the external collector), or nowhere.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;

use tracing::debug;

use crate::config::{LogRotate, LogSink};
use crate::service::Service;

/// Opens the file sink for a record, rotating first when the current file
/// exceeds the global size threshold. Non-file sinks return `None`; the
/// child redirects to `/dev/console` or `/dev/null` itself.
pub fn open_sink(svc: &Service, rotate: LogRotate) -> io::Result<Option<File>> {
    let LogSink::File(path) = &svc.conf.log else {
        return Ok(None);
    };

    if let Ok(meta) = fs::metadata(path)
        && meta.len() >= rotate.size
    {
        rotate_file(path, rotate.count);
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(Some(file))
}

/// Shifts `path` into `path.1`, `path.1` into `path.2`, and so on, keeping
/// at most `count` rotated files.
pub fn rotate_file(path: &Path, count: u32) {
    if count == 0 {
        let _ = fs::remove_file(path);
        return;
    }

    let numbered = |n: u32| {
        let mut s = path.as_os_str().to_os_string();
        s.push(format!(".{n}"));
        std::path::PathBuf::from(s)
    };

    let _ = fs::remove_file(numbered(count));
    for n in (1..count).rev() {
        let _ = fs::rename(numbered(n), numbered(n + 1));
    }
    let _ = fs::rename(path, numbered(1));
    debug!("rotated {}", path.display());
}
