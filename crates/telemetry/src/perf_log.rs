// SPDX-License-Identifier: Apache-2.0

//! Cycle-stamped perf logs.
//!
//! When enabled by environment variable, every completed sandbox (and,
//! separately, every finished HTTP session) appends one CSV line. Writes are
//! buffered and the file is shared across workers behind a lock; perf logging
//! is for offline analysis, not the hot path.

use crate::error::Error;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// A shared, append-only CSV log.
pub struct PerfLog {
    writer: Mutex<BufWriter<File>>,
}

impl PerfLog {
    /// Creates (truncating) the log at `path` and writes the header line.
    pub fn create(path: &Path, header: &str) -> Result<Self, Error> {
        let mk = |source| Error::PerfLogOpen {
            path: path.display().to_string(),
            source,
        };
        let file = File::create(path).map_err(mk)?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{header}").map_err(mk)?;
        Ok(Self {
            writer: Mutex::new(writer),
        })
    }

    /// Appends one record line.
    pub fn append(&self, line: &str) {
        let mut writer = self.writer.lock();
        // A perf log that cannot keep up silently drops records rather than
        // stalling a worker.
        let _ = writeln!(writer, "{line}");
    }

    /// Flushes buffered records to disk.
    pub fn flush(&self) {
        let _ = self.writer.lock().flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_land_in_order_with_header() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sandbox.log");
        let log = PerfLog::create(&path, "id,route,code").expect("create");
        log.append("1,/fib,200");
        log.append("2,/fib,500");
        log.flush();
        let contents = std::fs::read_to_string(&path).expect("read back");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines, vec!["id,route,code", "1,/fib,200", "2,/fib,500"]);
    }
}
