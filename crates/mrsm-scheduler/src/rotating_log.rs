//! A rotating log file writer: N files of a max size, oldest dropped
//! (spec §4.7: "default 5 x 500 KB; writers open by name via a
//! file-object abstraction that re-opens on size threshold").

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub const DEFAULT_MAX_BYTES: u64 = 500 * 1024;
pub const DEFAULT_MAX_FILES: u32 = 5;

/// Owns one job's log directory and the currently-open file. Rotation
/// happens lazily, checked on every write.
pub struct RotatingLog {
    dir: PathBuf,
    stem: String,
    max_bytes: u64,
    max_files: u32,
    current: File,
    current_len: u64,
}

impl RotatingLog {
    pub fn open(dir: &Path, stem: &str, max_bytes: u64, max_files: u32) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{stem}.log"));
        let current = OpenOptions::new().create(true).append(true).open(&path)?;
        let current_len = current.metadata()?.len();
        Ok(Self {
            dir: dir.to_path_buf(),
            stem: stem.to_string(),
            max_bytes,
            max_files,
            current,
            current_len,
        })
    }

    fn path_for(&self, index: u32) -> PathBuf {
        if index == 0 {
            self.dir.join(format!("{}.log", self.stem))
        } else {
            self.dir.join(format!("{}.log.{}", self.stem, index))
        }
    }

    /// Shifts `stem.log.{N-1} -> stem.log.{N}` down the chain, dropping
    /// whatever would fall off the end, then reopens a fresh `stem.log`.
    fn rotate(&mut self) -> io::Result<()> {
        let oldest = self.path_for(self.max_files - 1);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for index in (1..self.max_files).rev() {
            let from = self.path_for(index - 1);
            if from.exists() {
                fs::rename(&from, self.path_for(index))?;
            }
        }
        self.current = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.path_for(0))?;
        self.current_len = 0;
        Ok(())
    }

    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        if self.current_len >= self.max_bytes {
            self.rotate()?;
        }
        let bytes = line.as_bytes();
        self.current.write_all(bytes)?;
        self.current.write_all(b"\n")?;
        self.current.flush()?;
        self.current_len += bytes.len() as u64 + 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_keeps_at_most_max_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = RotatingLog::open(dir.path(), "job", 10, 3).unwrap();
        for i in 0..50 {
            log.write_line(&format!("line {i}")).unwrap();
        }
        let count = fs::read_dir(dir.path()).unwrap().count();
        assert!(count <= 3, "expected at most 3 rotated files, got {count}");
    }

    #[test]
    fn write_line_appends_without_rotating_under_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = RotatingLog::open(dir.path(), "job", DEFAULT_MAX_BYTES, DEFAULT_MAX_FILES).unwrap();
        log.write_line("hello").unwrap();
        log.write_line("world").unwrap();
        let contents = fs::read_to_string(dir.path().join("job.log")).unwrap();
        assert_eq!(contents, "hello\nworld\n");
    }
}
