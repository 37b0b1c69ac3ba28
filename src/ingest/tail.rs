use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};

use super::{parse_line, LogRecord};

/// Follows a set of append-only log files, yielding records for lines
/// appended since the previous poll.
#[derive(Debug, Default)]
pub struct LogTailer {
    files: Vec<TailedFile>,
}

#[derive(Debug)]
struct TailedFile {
    path: PathBuf,
    source: String,
    offset: u64,
    /// Bytes after the last newline; decoded only once the line completes.
    partial: Vec<u8>,
}

impl LogTailer {
    /// Start following `paths` from their current end, so history already
    /// on disk is not re-reported after a restart.
    pub async fn from_end(paths: &[PathBuf]) -> Self {
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let offset = tokio::fs::metadata(path)
                .await
                .map(|m| m.len())
                .unwrap_or(0);
            files.push(TailedFile::new(path, offset));
        }
        Self { files }
    }

    /// Start following `paths` from the beginning.
    pub fn from_start(paths: &[PathBuf]) -> Self {
        Self {
            files: paths.iter().map(|p| TailedFile::new(p, 0)).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Read newly appended complete lines from every file.
    pub async fn poll(&mut self) -> Vec<LogRecord> {
        let mut records = Vec::new();
        for file in &mut self.files {
            match file.read_new_lines().await {
                Ok(lines) => {
                    records.extend(lines.iter().filter_map(|l| parse_line(l, &file.source)));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %file.path.display(), error = %e, "Failed to read log file");
                }
            }
        }
        records
    }
}

impl TailedFile {
    fn new(path: &Path, offset: u64) -> Self {
        let source = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            path: path.to_path_buf(),
            source,
            offset,
            partial: Vec::new(),
        }
    }

    async fn read_new_lines(&mut self) -> std::io::Result<Vec<String>> {
        let len = tokio::fs::metadata(&self.path).await?.len();

        if len < self.offset {
            debug!(path = %self.path.display(), "Log file truncated, restarting from beginning");
            self.offset = 0;
            self.partial.clear();
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut buf = Vec::with_capacity((len - self.offset) as usize);
        file.read_to_end(&mut buf).await?;
        self.offset += buf.len() as u64;

        self.partial.extend_from_slice(&buf);

        let mut lines = Vec::new();
        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.partial.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            lines.push(line.trim_end_matches('\r').to_string());
        }
        Ok(lines)
    }
}
