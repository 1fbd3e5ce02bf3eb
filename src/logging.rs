//! Structured logging setup using tracing, and the logger sink used by the
//! name services for packet dumps.

use crate::config::{FileLoggingConfig, LogFormat, LogRotation, LoggingConfig};
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::{Mutex, MutexGuard};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Guard that must be kept alive for the duration of the program.
/// When dropped, flushes and closes the file writer.
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Initialize the logging system based on configuration.
/// Returns a guard that must be kept alive for file logging to work.
pub fn init_logging(config: &LoggingConfig) -> LogGuard {
    if !config.enabled {
        return LogGuard { _file_guard: None };
    }

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let (text_layer, json_layer) = match config.format {
        LogFormat::Text => (Some(fmt::layer().with_writer(io::stdout)), None),
        LogFormat::Json => (None, Some(fmt::layer().json().with_writer(io::stdout))),
    };

    let (file_layer, file_guard) = match &config.file {
        Some(file_config) => {
            let (writer, guard) = create_file_writer(file_config);
            (Some(fmt::layer().json().with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    // try_init: tests and embedders may already have installed a subscriber
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(text_layer)
        .with(json_layer)
        .with(file_layer)
        .try_init();

    LogGuard {
        _file_guard: file_guard,
    }
}

fn create_file_writer(
    config: &FileLoggingConfig,
) -> (tracing_appender::non_blocking::NonBlocking, WorkerGuard) {
    fs::create_dir_all(&config.log_dir).ok();

    let rotation = match config.rotation {
        LogRotation::Daily => Rotation::DAILY,
        LogRotation::Hourly => Rotation::HOURLY,
        LogRotation::Never => Rotation::NEVER,
    };

    let file_appender = RollingFileAppender::new(rotation, &config.log_dir, &config.file_prefix);

    tracing_appender::non_blocking(file_appender)
}

/// Spawn a background task that compresses rotated logs and prunes old ones.
pub fn spawn_log_maintenance(config: &LoggingConfig) {
    let Some(file_config) = config.file.clone() else {
        return;
    };

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(3600));
        // First tick fires immediately; give the appender a minute to open today's file
        tokio::time::sleep(Duration::from_secs(60)).await;
        loop {
            interval.tick().await;
            if file_config.compress {
                compress_rotated_logs(&file_config.log_dir, &file_config.file_prefix);
            }
            if file_config.max_age_days > 0 {
                prune_old_logs(
                    &file_config.log_dir,
                    &file_config.file_prefix,
                    file_config.max_age_days,
                );
            }
        }
    });
}

/// Names of rotated files eligible for compression: our prefix, not the
/// active file, not already gzipped.
fn rotated_log_files(log_dir: &str, file_prefix: &str) -> Vec<std::path::PathBuf> {
    let today_suffix = chrono::Utc::now().format(".%Y-%m-%d").to_string();
    let active = format!("{}{}", file_prefix, today_suffix);

    let entries = match fs::read_dir(log_dir) {
        Ok(e) => e,
        Err(e) => {
            tracing::warn!(error = %e, dir = log_dir, "Failed to read log directory");
            return Vec::new();
        }
    };

    entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|name| {
                    name.starts_with(file_prefix)
                        && name != file_prefix
                        && name != active
                        && !name.ends_with(".gz")
                })
                .unwrap_or(false)
        })
        .collect()
}

fn compress_rotated_logs(log_dir: &str, file_prefix: &str) {
    for path in rotated_log_files(log_dir, file_prefix) {
        match gzip_file(&path) {
            Ok(()) => tracing::info!(path = %path.display(), "Compressed rotated log file"),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to compress log file")
            }
        }
    }
}

/// Gzip `path` next to itself and remove the original.
fn gzip_file(path: &Path) -> io::Result<()> {
    let mut gz_name = path.as_os_str().to_owned();
    gz_name.push(".gz");

    let mut reader = BufReader::new(File::open(path)?);
    let writer = BufWriter::new(File::create(&gz_name)?);
    let mut encoder = GzEncoder::new(writer, Compression::default());
    io::copy(&mut reader, &mut encoder)?;
    encoder.finish()?;

    fs::remove_file(path)
}

fn prune_old_logs(log_dir: &str, file_prefix: &str, max_age_days: u64) {
    let max_age = Duration::from_secs(max_age_days * 24 * 60 * 60);

    let Ok(entries) = fs::read_dir(log_dir) else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let is_ours = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|name| name.starts_with(file_prefix) && name != file_prefix)
            .unwrap_or(false);
        if !is_ours {
            continue;
        }

        let age = path
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok());

        if let Some(age) = age.filter(|age| *age > max_age) {
            match fs::remove_file(&path) {
                Ok(()) => tracing::info!(
                    path = %path.display(),
                    age_days = age.as_secs() / 86400,
                    "Deleted old log file"
                ),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to delete old log file")
                }
            }
        }
    }
}

// ============== Logger sink ==============

/// Held while a multi-line dump is written; dropping it releases the sink.
pub struct SinkLock<'a> {
    _guard: Option<MutexGuard<'a, ()>>,
}

impl SinkLock<'_> {
    /// A lock that serializes nothing, for sinks that are already atomic per line
    pub fn unlocked() -> Self {
        SinkLock { _guard: None }
    }
}

/// Destination for the name services' diagnostic output.
pub trait LogSink: Send + Sync {
    fn debug(&self, msg: &str);

    /// Informational message stamped with a microsecond timestamp
    fn info_microseconds(&self, msg: &str);

    /// Serialize a multi-line dump against other writers
    fn lock(&self) -> SinkLock<'_>;
}

/// Default sink forwarding to `tracing`
#[derive(Default)]
pub struct TracingSink {
    dump_lock: Mutex<()>,
}

impl TracingSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogSink for TracingSink {
    fn debug(&self, msg: &str) {
        tracing::debug!("{}", msg);
    }

    fn info_microseconds(&self, msg: &str) {
        let at = chrono::Utc::now().format("%H:%M:%S%.6f");
        tracing::info!(at = %at, "{}", msg);
    }

    fn lock(&self) -> SinkLock<'_> {
        SinkLock {
            _guard: Some(self.dump_lock.lock()),
        }
    }
}

/// Write a titled multi-line dump atomically with respect to other dumps.
pub fn dump(sink: &dyn LogSink, title: &str, lines: &[String]) {
    let _lock = sink.lock();
    sink.debug(title);
    for line in lines {
        sink.debug(&format!("  {}", line));
    }
}
