//! Local file backend: one JSON event per line.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{JobEvent, Result};

pub struct FileBackend {
    path: PathBuf,
    file: Option<File>,
}

impl FileBackend {
    pub fn new(path: &Path) -> FileBackend {
        FileBackend { path: path.to_path_buf(), file: None }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn open(&mut self) -> Result<()> {
        self.file = Some(File::create(&self.path)?);
        Ok(())
    }

    pub fn write(&mut self, event: &JobEvent) -> Result<()> {
        let file = self.file.as_mut().ok_or(super::LoggerError::Closed)?;

        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        file.write_all(&line)?;

        Ok(())
    }

    /// Stream up to `max_lines` complete lines starting at `start_line`
    /// (0-indexed) into `writer`. Returns the line number to resume from.
    /// A trailing partial line (still being written) is not emitted and
    /// not counted.
    pub fn stream(
        &self,
        start_line: usize,
        max_lines: usize,
        writer: &mut dyn Write,
    ) -> Result<usize> {
        stream_file(&self.path, start_line, max_lines, writer)
    }

    /// Close and remove the log file.
    pub fn close(&mut self) -> Result<()> {
        self.file.take();

        debug!("Removing {}", self.path.display());
        std::fs::remove_file(&self.path)?;

        Ok(())
    }
}

pub(super) fn stream_file(
    path: &Path,
    start_line: usize,
    max_lines: usize,
    writer: &mut dyn Write,
) -> Result<usize> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut line_number = 0;
    let mut lines_streamed = 0;
    let mut line = Vec::new();

    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line)?;
        if n == 0 {
            break;
        }

        // An unterminated tail is a line still being appended.
        if line.last() != Some(&b'\n') {
            break;
        }

        if line_number < start_line {
            line_number += 1;
            continue;
        }

        line_number += 1;
        writer.write_all(&line)?;
        lines_streamed += 1;

        if lines_streamed == max_lines {
            break;
        }
    }

    Ok(line_number)
}

#[cfg(test)]
mod tests {
    use super::super::{JobEvent, JobResult};
    use super::*;

    fn sample_backend(dir: &Path) -> FileBackend {
        let mut backend = FileBackend::new(&dir.join("log.json"));
        backend.open().unwrap();
        for i in 0..5 {
            backend
                .write(&JobEvent::CommandOutput { output: format!("line-{i}\n"), timestamp: i })
                .unwrap();
        }
        backend
    }

    #[test]
    fn stream_from_the_beginning() {
        let dir = tempfile::tempdir().unwrap();
        let backend = sample_backend(dir.path());

        let mut out = Vec::new();
        let next = backend.stream(0, usize::MAX, &mut out).unwrap();

        assert_eq!(next, 5);
        assert_eq!(String::from_utf8(out).unwrap().lines().count(), 5);
    }

    #[test]
    fn stream_resumes_from_a_line_number() {
        let dir = tempfile::tempdir().unwrap();
        let backend = sample_backend(dir.path());

        let mut out = Vec::new();
        let next = backend.stream(3, usize::MAX, &mut out).unwrap();

        assert_eq!(next, 5);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("line-3"));
        assert!(text.contains("line-4"));
        assert!(!text.contains("line-2"));
    }

    #[test]
    fn stream_respects_max_lines() {
        let dir = tempfile::tempdir().unwrap();
        let backend = sample_backend(dir.path());

        let mut out = Vec::new();
        let next = backend.stream(0, 2, &mut out).unwrap();

        assert_eq!(next, 2);
        assert_eq!(String::from_utf8(out).unwrap().lines().count(), 2);

        // Resuming from the returned cursor picks up where we left off.
        let mut rest = Vec::new();
        let next = backend.stream(next, usize::MAX, &mut rest).unwrap();
        assert_eq!(next, 5);
        assert_eq!(String::from_utf8(rest).unwrap().lines().count(), 3);
    }

    #[test]
    fn stream_past_the_end_returns_the_same_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let backend = sample_backend(dir.path());

        let mut out = Vec::new();
        let next = backend.stream(5, usize::MAX, &mut out).unwrap();
        assert_eq!(next, 5);
        assert!(out.is_empty());
    }

    #[test]
    fn close_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = sample_backend(dir.path());
        let path = backend.path().to_path_buf();

        assert!(path.exists());
        backend.close().unwrap();
        assert!(!path.exists());
    }
}
