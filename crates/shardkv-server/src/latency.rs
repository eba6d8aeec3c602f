//! Request latency traces
//!
//! The network worker stamps one entry time per incoming request and
//! one exit time per response pushed. On shutdown the pairs are dumped
//! as TSV, nanoseconds relative to the first recorded entry.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::time::Instant;

#[derive(Debug)]
pub struct LatencyLog {
    path: PathBuf,
    entries: Vec<Instant>,
    exits: Vec<Instant>,
}

impl LatencyLog {
    pub fn new(path: PathBuf) -> Self {
        // Sized so recording never reallocates mid-benchmark.
        Self {
            path,
            entries: Vec::with_capacity(1 << 20),
            exits: Vec::with_capacity(1 << 20),
        }
    }

    #[inline]
    pub fn record_entry(&mut self) {
        self.entries.push(Instant::now());
    }

    #[inline]
    pub fn record_exit(&mut self) {
        self.exits.push(Instant::now());
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Write the trace file, returning the number of rows.
    pub fn dump(&self) -> io::Result<usize> {
        let mut out = BufWriter::new(File::create(&self.path)?);
        writeln!(out, "entry\texit")?;
        let Some(&origin) = self.entries.first() else {
            out.flush()?;
            return Ok(0);
        };
        let rows = self.entries.len().min(self.exits.len());
        for i in 0..rows {
            writeln!(
                out,
                "{}\t{}",
                self.entries[i].duration_since(origin).as_nanos(),
                self.exits[i].duration_since(origin).as_nanos(),
            )?;
        }
        out.flush()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("net_traces");
        let mut log = LatencyLog::new(path.clone());

        log.record_entry();
        log.record_exit();
        log.record_entry();
        log.record_exit();
        assert_eq!(log.dump().unwrap(), 2);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "entry\texit");
        // The first entry is the origin of the scale.
        assert!(lines[1].starts_with("0\t"));
        for row in &lines[1..] {
            let (entry, exit) = row.split_once('\t').unwrap();
            let entry: u128 = entry.parse().unwrap();
            let exit: u128 = exit.parse().unwrap();
            assert!(exit >= entry);
        }
    }

    #[test]
    fn test_empty_log_writes_header_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("net_traces");
        assert_eq!(LatencyLog::new(path.clone()).dump().unwrap(), 0);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "entry\texit\n");
    }
}
