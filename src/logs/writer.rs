use crate::config::LogTargets;
use crate::error::{Result, VigilError};
use chrono::{DateTime, Local};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File as TokioFile;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

/// Appends timestamped lines of process output to one file
pub struct LogWriter {
    path: PathBuf,
    file: TokioFile,
    date_format: String,
}

/// A writer shared by the tasks forwarding stdout and stderr
pub type SharedLogWriter = Arc<Mutex<LogWriter>>;

impl LogWriter {
    /// Open `path` for appending, creating parent directories as needed
    pub fn open(path: &Path, date_format: &str) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                VigilError::LogError(format!("Failed to create log directory: {}", e))
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                VigilError::LogFileError(format!("Failed to open {}: {}", path.display(), e))
            })?;

        Ok(Self {
            path: path.to_path_buf(),
            file: TokioFile::from_std(file),
            date_format: date_format.to_string(),
        })
    }

    /// Write one line with a timestamp prefix
    pub async fn write_line(&mut self, data: &[u8]) -> Result<()> {
        let entry = self.format_log_entry(&Local::now(), data);

        self.file
            .write_all(&entry)
            .await
            .map_err(|e| VigilError::LogError(format!("Failed to write to log: {}", e)))?;

        self.file
            .flush()
            .await
            .map_err(|e| VigilError::LogError(format!("Failed to flush log: {}", e)))?;

        Ok(())
    }

    /// Format: [<timestamp>] <data>\n
    fn format_log_entry(&self, timestamp: &DateTime<Local>, data: &[u8]) -> Vec<u8> {
        let timestamp_str = timestamp.format(&self.date_format).to_string();
        let mut entry = Vec::with_capacity(timestamp_str.len() + 4 + data.len());

        entry.extend_from_slice(b"[");
        entry.extend_from_slice(timestamp_str.as_bytes());
        entry.extend_from_slice(b"] ");
        entry.extend_from_slice(data);

        if !data.ends_with(b"\n") {
            entry.push(b'\n');
        }

        entry
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Destinations for the two output streams of one process
#[derive(Default)]
pub struct LogSinks {
    pub stdout: Option<SharedLogWriter>,
    pub stderr: Option<SharedLogWriter>,
}

impl LogSinks {
    /// Open the files named by `targets`
    ///
    /// With `combine` both streams share a single writer on `out_file`
    /// (or `error_file` when only that one is set).
    pub fn open(targets: &LogTargets) -> Result<Self> {
        let open = |path: &PathBuf| -> Result<SharedLogWriter> {
            Ok(Arc::new(Mutex::new(LogWriter::open(path, &targets.date_format)?)))
        };

        if targets.combine {
            let shared = match targets.out_file.as_ref().or(targets.error_file.as_ref()) {
                Some(path) => Some(open(path)?),
                None => None,
            };
            return Ok(Self {
                stdout: shared.clone(),
                stderr: shared,
            });
        }

        let stdout = targets.out_file.as_ref().map(open).transpose()?;
        let stderr = match (&targets.error_file, &targets.out_file) {
            (Some(err), Some(out)) if err == out => stdout.clone(),
            (Some(err), _) => Some(open(err)?),
            (None, _) => None,
        };

        Ok(Self { stdout, stderr })
    }
}

/// Copy `reader` line by line into `writer` until EOF
pub fn forward_lines<R>(app: String, reader: R, writer: SharedLogWriter) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        let mut write_failed = false;

        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    // Keep draining after a failure so the child never blocks on a full pipe
                    if write_failed {
                        continue;
                    }
                    if let Err(e) = writer.lock().await.write_line(&line).await {
                        warn!("Dropping output of app '{}': {}", app, e);
                        write_failed = true;
                    }
                }
                Err(e) => {
                    warn!("Failed to read output of app '{}': {}", app, e);
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn targets(dir: &Path, out: Option<&str>, err: Option<&str>, combine: bool) -> LogTargets {
        LogTargets {
            out_file: out.map(|name| dir.join(name)),
            error_file: err.map(|name| dir.join(name)),
            combine,
            date_format: "%Y-%m-%d %H:%M:%S".to_string(),
        }
    }

    #[tokio::test]
    async fn test_write_line_adds_timestamp_and_newline() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("out.log");

        let mut writer = LogWriter::open(&path, "%Y").unwrap();
        writer.write_line(b"hello").await.unwrap();
        writer.write_line(b"world\n").await.unwrap();

        let contents = std::fs::read_to_string(writer.path()).unwrap();
        let year = Local::now().format("%Y").to_string();
        assert_eq!(contents, format!("[{year}] hello\n[{year}] world\n"));
    }

    #[test]
    fn test_format_log_entry() {
        let temp_dir = TempDir::new().unwrap();
        let writer = LogWriter::open(&temp_dir.path().join("a.log"), "%Y-%m-%d %H:%M:%S").unwrap();
        let timestamp = Local.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap();

        let entry = writer.format_log_entry(&timestamp, b"started");
        assert_eq!(entry, b"[2024-01-15 10:30:00] started\n".to_vec());
    }

    #[tokio::test]
    async fn test_sinks_separate_files() {
        let temp_dir = TempDir::new().unwrap();
        let sinks = LogSinks::open(&targets(temp_dir.path(), Some("out.log"), Some("err.log"), false)).unwrap();

        let stdout = sinks.stdout.unwrap();
        let stderr = sinks.stderr.unwrap();
        assert!(!Arc::ptr_eq(&stdout, &stderr));
        assert!(stdout.lock().await.path().ends_with("out.log"));
        assert!(stderr.lock().await.path().ends_with("err.log"));
    }

    #[tokio::test]
    async fn test_sinks_combined() {
        let temp_dir = TempDir::new().unwrap();
        let sinks = LogSinks::open(&targets(temp_dir.path(), Some("out.log"), Some("err.log"), true)).unwrap();

        let stdout = sinks.stdout.unwrap();
        let stderr = sinks.stderr.unwrap();
        assert!(Arc::ptr_eq(&stdout, &stderr));
        assert!(!temp_dir.path().join("err.log").exists());
    }

    #[test]
    fn test_sinks_only_error_file() {
        let temp_dir = TempDir::new().unwrap();
        let sinks = LogSinks::open(&targets(temp_dir.path(), None, Some("err.log"), false)).unwrap();

        assert!(sinks.stdout.is_none());
        assert!(sinks.stderr.is_some());
    }

    #[tokio::test]
    async fn test_forward_lines() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("out.log");
        let writer = Arc::new(Mutex::new(LogWriter::open(&path, "%Y").unwrap()));

        let input: &[u8] = b"first\nsecond\nno newline";
        forward_lines("test".to_string(), input, writer).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("] first"));
        assert!(lines[2].ends_with("] no newline"));
    }
}
