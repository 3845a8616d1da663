//! Append-only destinations for received log lines.

use std::fs::{File, OpenOptions};
use std::io::{self, LineWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

/// Where the log receiver appends lines.
pub trait LogSink: Send + Sync {
    fn append(&self, line: &str) -> io::Result<()>;
}

/// Appends each line to a file, flushing on every newline.
pub struct FileSink {
    path: PathBuf,
    writer: Mutex<LineWriter<File>>,
}

impl FileSink {
    /// Create `logger_server_<millis>.log` inside `dir`.
    pub fn create(dir: &Path) -> io::Result<Self> {
        let name = format!("logger_server_{}.log", chrono::Utc::now().timestamp_millis());
        Self::open(dir.join(name))
    }

    /// Open (or create) a specific file in append mode.
    pub fn open(path: PathBuf) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(LineWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogSink for FileSink {
    fn append(&self, line: &str) -> io::Result<()> {
        let mut writer = self.writer.lock();
        writeln!(writer, "{}", line)
    }
}

#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct MemorySink {
    lines: Mutex<Vec<String>>,
}

#[cfg(test)]
impl MemorySink {
    pub(crate) fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}

#[cfg(test)]
impl LogSink for MemorySink {
    fn append(&self, line: &str) -> io::Result<()> {
        self.lines.lock().push(line.to_string());
        Ok(())
    }
}
