//! Log sink: size-bounded rotating files plus a live stdout stream.

use chrono::Utc;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::error::DeployError;

pub const MAX_LOG_FILE_BYTES: u64 = 1024 * 1024; // 1MB
pub const DEFAULT_MAX_LOG_FILES: usize = 5;
pub const SERVICE_LOG_FILE: &str = "deploy_hook.log";

/// A log file that rolls over once it would exceed `max_bytes`.
///
/// On rotation `name` becomes `name.1`, `name.1` becomes `name.2` and so on;
/// anything beyond `name.<max_backups>` is deleted.
pub struct RotatingFile {
    path: PathBuf,
    max_bytes: u64,
    max_backups: usize,
    file: File,
    written: u64,
}

impl RotatingFile {
    pub fn open(path: impl Into<PathBuf>, max_bytes: u64, max_backups: usize) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path,
            max_bytes,
            max_backups,
            file,
            written,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn backup_path(&self, n: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{}", n));
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;

        if self.max_backups > 0 {
            let oldest = self.backup_path(self.max_backups);
            if oldest.exists() {
                fs::remove_file(&oldest)?;
            }
            for n in (1..self.max_backups).rev() {
                let src = self.backup_path(n);
                if src.exists() {
                    fs::rename(&src, self.backup_path(n + 1))?;
                }
            }
            fs::rename(&self.path, self.backup_path(1))?;
        }

        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_bytes {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Per-build log: captured process output, one timestamped line per entry.
pub struct BuildLog {
    file: RotatingFile,
}

impl BuildLog {
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        Ok(Self {
            file: RotatingFile::open(path, MAX_LOG_FILE_BYTES, DEFAULT_MAX_LOG_FILES)?,
        })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn write_line(&mut self, level: Level, stream: &str, line: &str) -> io::Result<()> {
        let entry = format!(
            "{} {:>5} {}: {}\n",
            Utc::now().to_rfc3339(),
            level.as_str(),
            stream,
            line.trim_end_matches(['\r', '\n'])
        );
        // One write per entry so a rotation never splits a line
        self.file.write_all(entry.as_bytes())?;
        self.file.flush()
    }
}

pub struct FileLogger {
    log_directory: PathBuf,
    max_file_bytes: u64,
    max_files: usize,
}

impl FileLogger {
    pub fn new(log_directory: PathBuf) -> Self {
        Self {
            log_directory,
            max_file_bytes: MAX_LOG_FILE_BYTES,
            max_files: DEFAULT_MAX_LOG_FILES,
        }
    }

    pub fn with_max_files(mut self, max_files: usize) -> Self {
        self.max_files = max_files;
        self
    }

    pub fn with_max_file_bytes(mut self, max_file_bytes: u64) -> Self {
        self.max_file_bytes = max_file_bytes;
        self
    }

    /// Opens the service log and moves writes onto a dedicated worker thread.
    /// That worker is the single writer, so concurrent builds logging at the
    /// same time never interleave partial lines.
    pub fn setup_file_logging(&self) -> io::Result<(NonBlocking, WorkerGuard)> {
        // Ensure log directory exists
        fs::create_dir_all(&self.log_directory)?;

        let file = RotatingFile::open(
            self.log_directory.join(SERVICE_LOG_FILE),
            self.max_file_bytes,
            self.max_files,
        )?;

        Ok(tracing_appender::non_blocking(file))
    }
}

/// Installs the global subscriber: stdout plus the rotating service log.
/// The returned guard must be held for the life of the process.
pub fn setup_logging(file_logger: &FileLogger) -> Result<WorkerGuard, DeployError> {
    let (file_writer, guard) = file_logger.setup_file_logging()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer()) // Console output
        .with(
            fmt::layer().with_writer(file_writer).with_ansi(false), // Disable ANSI colors for file logs
        )
        .try_init()
        .map_err(|e| DeployError::ConfigError(format!("Failed to install logger: {}", e)))?;

    Ok(guard)
}
