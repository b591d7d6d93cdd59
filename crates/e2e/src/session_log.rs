//! Session transcript: console plus a per-run log file with retention

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use tracing::{debug, warn};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::{E2eError, E2eResult};

/// Default number of log files kept in the logs directory
pub const DEFAULT_RETENTION: usize = 10;

const LOG_PREFIX: &str = "integration_test_";
const LOG_EXTENSION: &str = "log";

/// The open log file of the current run
pub struct SessionLog {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl SessionLog {
    /// Create a timestamped log file in `dir`, then retire all but the
    /// `retention` most recently modified log files (the new one included).
    pub fn create(dir: &Path, retention: usize) -> E2eResult<Self> {
        std::fs::create_dir_all(dir)?;

        let name = format!(
            "{}{}.{}",
            LOG_PREFIX,
            chrono::Local::now().format("%Y%m%d_%H%M%S"),
            LOG_EXTENSION
        );
        let path = dir.join(name);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        for removed in prune_logs(dir, retention)? {
            debug!("Removed old log file {}", removed.display());
        }

        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writer that appends to this log, flushing every write
    pub fn writer(&self) -> SessionWriter {
        SessionWriter {
            file: self.file.clone(),
        }
    }

    /// Install the global subscriber: the file layer always, the console
    /// layer when `echo_console` is set. Filter comes from `RUST_LOG`,
    /// defaulting to `info`.
    pub fn install(&self, echo_console: bool) -> E2eResult<()> {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let console = echo_console.then(|| fmt::layer().with_writer(io::stdout));
        let file = fmt::layer().with_ansi(false).with_writer(self.writer());

        tracing_subscriber::registry()
            .with(filter)
            .with(console)
            .with(file)
            .try_init()
            .map_err(|e| E2eError::Logging(e.to_string()))
    }
}

#[derive(Clone)]
pub struct SessionWriter {
    file: Arc<Mutex<File>>,
}

impl Write for SessionWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut file = self.file.lock();
        file.write_all(buf)?;
        file.flush()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.lock().flush()
    }
}

impl<'a> MakeWriter<'a> for SessionWriter {
    type Writer = SessionWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn is_session_log(path: &Path) -> bool {
    let named = path
        .file_name()
        .map(|name| name.to_string_lossy().starts_with(LOG_PREFIX))
        .unwrap_or(false);
    named && path.extension().map(|ext| ext == LOG_EXTENSION).unwrap_or(false)
}

/// Delete all but the `keep` most recently modified session logs in `dir`.
/// Other files, including unrelated `*.log` files, are left alone.
/// Returns the removed paths.
pub fn prune_logs(dir: &Path, keep: usize) -> E2eResult<Vec<PathBuf>> {
    let mut logs: Vec<(SystemTime, PathBuf)> = walkdir::WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| is_session_log(e.path()))
        .filter_map(|e| {
            let modified = e.metadata().ok()?.modified().ok()?;
            Some((modified, e.into_path()))
        })
        .collect();

    // Newest first
    logs.sort_by(|a, b| b.0.cmp(&a.0));

    let mut removed = Vec::new();
    for (_, path) in logs.into_iter().skip(keep) {
        match std::fs::remove_file(&path) {
            Ok(()) => removed.push(path),
            Err(e) => warn!("Could not remove old log {}: {}", path.display(), e),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn touch(dir: &Path, name: &str, age_secs: u64) -> PathBuf {
        let path = dir.join(name);
        let file = File::create(&path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(age_secs))
            .unwrap();
        path
    }

    #[test]
    fn test_prune_keeps_most_recent() {
        let dir = tempfile::tempdir().unwrap();
        let paths: Vec<PathBuf> = (0..5)
            .map(|i| touch(dir.path(), &format!("{}run{}.log", LOG_PREFIX, i), 100 - i * 10))
            .collect();
        let unrelated = touch(dir.path(), "results.json", 1000);
        let foreign_log = touch(dir.path(), "backend.log", 2000);

        let removed = prune_logs(dir.path(), 2).unwrap();

        assert_eq!(removed.len(), 3);
        assert!(paths[3].exists());
        assert!(paths[4].exists());
        assert!(!paths[0].exists());
        assert!(unrelated.exists());
        assert!(foreign_log.exists());
    }

    #[test]
    fn test_create_applies_retention() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..12 {
            touch(dir.path(), &format!("{}old{:02}.log", LOG_PREFIX, i), 1000 + i);
        }

        let log = SessionLog::create(dir.path(), DEFAULT_RETENTION).unwrap();

        let remaining = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(remaining, DEFAULT_RETENTION);
        assert!(log.path().exists());
        assert!(log
            .path()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(LOG_PREFIX));
    }

    #[test]
    fn test_writer_persists_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let log = SessionLog::create(dir.path(), DEFAULT_RETENTION).unwrap();

        let mut writer = log.writer();
        writer.write_all(b"backend ready\n").unwrap();

        // Readable without dropping or flushing the writer
        let content = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(content, "backend ready\n");
    }
}
