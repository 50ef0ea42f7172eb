//! File sink with size-based rotation
//!
//! Appends one line per packet. When rotation is enabled and the file has
//! reached `max_size_mb`, existing backups shift up (`.1` -> `.2` and so on,
//! the oldest falling off at `max_backups`), the current file becomes `.1`,
//! and a fresh file is opened at the primary path. A mutex serializes writes;
//! the rotation check runs before each write under the same lock.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::OutputFormat;
use crate::error::{RelayError, Result};
use crate::message::Packet;
use crate::output::{format_text_line, Sink};

pub struct FileSink {
    path: PathBuf,
    format: OutputFormat,
    enabled: bool,
    rotate: bool,
    max_size_bytes: u64,
    max_backups: u32,
    file: Mutex<Option<File>>,
}

impl FileSink {
    pub fn new(
        path: impl AsRef<Path>,
        format: OutputFormat,
        enabled: bool,
        rotate: bool,
        max_size_mb: u64,
        max_backups: u32,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).map_err(|e| {
                    RelayError::SinkUnavailable(format!(
                        "failed to create log directory {}: {e}",
                        dir.display()
                    ))
                })?;
            }
        }

        let file = open_append(&path)?;

        Ok(Self {
            path,
            format,
            enabled,
            rotate,
            max_size_bytes: max_size_mb * 1024 * 1024,
            max_backups,
            file: Mutex::new(Some(file)),
        })
    }

    fn render(&self, packet: &Packet) -> Result<String> {
        Ok(match self.format {
            OutputFormat::Json => serde_json::to_string(packet)?,
            OutputFormat::Text => format_text_line(packet),
        })
    }

    /// Shift backups and reopen the primary path once the size threshold is
    /// crossed. Called with the file lock held.
    fn check_rotation(&self, file: &mut Option<File>) -> Result<()> {
        let current = file.as_ref().ok_or(RelayError::NotConnected)?;
        let size = current.metadata()?.len();
        if size < self.max_size_bytes {
            return Ok(());
        }

        // Close before renaming
        *file = None;

        for i in (1..self.max_backups).rev() {
            let old = backup_path(&self.path, i);
            if old.exists() {
                let new = backup_path(&self.path, i + 1);
                if let Err(e) = std::fs::rename(&old, &new) {
                    warn!(from = %old.display(), error = %e, "failed to shift backup");
                }
            }
        }
        if let Err(e) = std::fs::rename(&self.path, backup_path(&self.path, 1)) {
            warn!(path = %self.path.display(), error = %e, "failed to rotate log file");
        }

        *file = Some(open_append(&self.path)?);
        Ok(())
    }
}

fn backup_path(path: &Path, n: u32) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(format!(".{n}"));
    PathBuf::from(s)
}

fn open_append(path: &Path) -> Result<File> {
    let mut options = OpenOptions::new();
    options.append(true).create(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o644);
    }
    options.open(path).map_err(|e| {
        RelayError::SinkUnavailable(format!("failed to open log file {}: {e}", path.display()))
    })
}

#[async_trait]
impl Sink for FileSink {
    async fn send(&self, _cancel: &CancellationToken, packet: &Packet) -> Result<()> {
        let line = self.render(packet)?;

        let mut guard = self.file.lock();
        if self.rotate {
            self.check_rotation(&mut guard)?;
        }
        let file = guard.as_mut().ok_or(RelayError::NotConnected)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // Dropping the handle flushes and closes; sends after this fail
        *self.file.lock() = None;
        Ok(())
    }

    fn name(&self) -> String {
        format!("file:{}", self.path.display())
    }

    fn enabled(&self) -> bool {
        self.enabled
    }
}
