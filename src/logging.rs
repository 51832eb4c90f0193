use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::intent::Intent;

type SharedFile = Arc<Mutex<Option<File>>>;

fn lock(inner: &SharedFile) -> MutexGuard<'_, Option<File>> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Subscriber ───────────────────────────────────────────

/// Install the global subscriber: stderr filtered by `RUST_LOG` (or
/// everything at debug with `verbose`), plus a file layer that stays
/// silent until the returned handle is pointed at a file.
pub fn init(verbose: bool) -> DeferredFileHandle {
    let terminal_filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
            .add_directive("hamc=info".parse().expect("valid log directive"))
    };

    let terminal_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(terminal_filter);

    // File layer: always captures hamc=debug, initially discards until activated
    let (file_writer, file_handle) = DeferredFileWriter::new();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(EnvFilter::new("hamc=debug"));

    tracing_subscriber::registry()
        .with(terminal_layer)
        .with(file_layer)
        .init();

    file_handle
}

// ── DeferredFileWriter ───────────────────────────────────

/// A `MakeWriter` that initially discards writes, then logs to a file
/// once activated via `handle.set_file(path)`.
///
/// The subscriber is installed before the config is read; file logging
/// starts once the session file names a journal directory.
#[derive(Clone)]
pub struct DeferredFileWriter {
    inner: SharedFile,
}

/// Handle returned by `DeferredFileWriter::new()`; call `set_file` to activate.
#[derive(Clone)]
pub struct DeferredFileHandle {
    inner: SharedFile,
}

impl DeferredFileWriter {
    pub fn new() -> (Self, DeferredFileHandle) {
        let inner = Arc::new(Mutex::new(None));
        (
            Self {
                inner: inner.clone(),
            },
            DeferredFileHandle { inner },
        )
    }
}

impl DeferredFileHandle {
    /// Activate the file writer; opens `path` in append mode.
    pub fn set_file(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        *lock(&self.inner) = Some(file);
        Ok(())
    }
}

/// Writer returned by `MakeWriter::make_writer`: either writes to the
/// file or discards (when not yet activated).
pub struct DeferredWriter {
    inner: SharedFile,
}

impl std::io::Write for DeferredWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match lock(&self.inner).as_mut() {
            Some(f) => f.write(buf),
            None => Ok(buf.len()), // discard
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match lock(&self.inner).as_mut() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for DeferredFileWriter {
    type Writer = DeferredWriter;

    fn make_writer(&'a self) -> Self::Writer {
        DeferredWriter {
            inner: self.inner.clone(),
        }
    }
}

// ── IntentJournal ────────────────────────────────────────

/// Append-only record of every intent handed to the executor.
///
/// Creates `<timestamp>_intents.log`; one line per submission:
/// `<timestamp> <host> <live|dry-run> <ok|failed> <intent>`.
pub struct IntentJournal {
    file: SharedFile,
    path: PathBuf,
}

impl IntentJournal {
    pub fn create(dir: &Path) -> std::io::Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}_intents.log", utc_timestamp()));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            file: Arc::new(Mutex::new(Some(file))),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, intent: &Intent, host: &str, dry_run: bool, ok: bool) {
        let mode = if dry_run { "dry-run" } else { "live" };
        let status = if ok { "ok" } else { "failed" };
        if let Some(f) = lock(&self.file).as_mut() {
            let _ = writeln!(f, "{} {host} {mode} {status} {intent}", utc_timestamp());
        }
    }
}

impl std::fmt::Debug for IntentJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntentJournal").field("path", &self.path).finish()
    }
}

// ── Journal rotation ─────────────────────────────────────

/// Delete the oldest intent journals in `dir`, keeping at most `keep`.
pub fn rotate_journals(dir: &Path, keep: usize) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };

    let mut matching: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|f| f.to_str())
                .is_some_and(|f| f.ends_with("_intents.log"))
        })
        .collect();

    // Sort by filename (timestamp prefix ensures chronological order)
    matching.sort();

    if matching.len() > keep {
        for old in &matching[..matching.len() - keep] {
            let _ = fs::remove_file(old);
        }
    }
}

// ── Timestamp helper ─────────────────────────────────────

/// Format the current UTC time as `YYYY-MM-DDTHH-MM-SS` without any
/// external datetime dependency.
pub fn utc_timestamp() -> String {
    let dur = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = dur.as_secs();

    let days = (secs / 86400) as i64;
    let time_of_day = secs % 86400;
    let hours = time_of_day / 3600;
    let minutes = (time_of_day % 3600) / 60;
    let seconds = time_of_day % 60;

    // Howard Hinnant's civil_from_days
    let z = days + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };

    format!("{y:04}-{m:02}-{d:02}T{hours:02}-{minutes:02}-{seconds:02}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_shape() {
        let ts = utc_timestamp();
        assert_eq!(ts.len(), 19);
        assert_eq!(&ts[4..5], "-");
        assert_eq!(&ts[10..11], "T");
    }

    #[test]
    fn journal_appends_one_line_per_intent() {
        let dir = tempfile::tempdir().unwrap();
        let journal = IntentJournal::create(dir.path()).unwrap();
        journal.record(&Intent::StartDomain { domain: "vm1".into() }, "h1", false, true);
        journal.record(&Intent::RemoveOrder { id: "ord_a_b".into() }, "h2", true, false);

        let contents = fs::read_to_string(journal.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(" h1 live ok "));
        assert!(lines[0].contains("vm1"));
        assert!(lines[1].contains(" h2 dry-run failed "));
    }

    #[test]
    fn rotation_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        for ts in ["2024-01-01T00-00-00", "2024-01-02T00-00-00", "2024-01-03T00-00-00"] {
            File::create(dir.path().join(format!("{ts}_intents.log"))).unwrap();
        }
        File::create(dir.path().join("hamc.log")).unwrap();
        rotate_journals(dir.path(), 2);

        let mut left: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(
            left,
            vec![
                "2024-01-02T00-00-00_intents.log",
                "2024-01-03T00-00-00_intents.log",
                "hamc.log",
            ]
        );
    }
}
