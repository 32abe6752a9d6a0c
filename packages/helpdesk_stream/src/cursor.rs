//! Resumable follow position.
//!
//! The cursor file is small JSON rewritten atomically: serialize into a temp
//! file in the same directory, then rename it over the target.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::CursorError;

pub const CURSOR_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowCursor {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub account_id: u64,
    #[serde(default)]
    pub last_seen_message_id: u64,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl FollowCursor {
    pub fn new(base_url: &str, account_id: u64) -> Self {
        Self {
            version: CURSOR_VERSION,
            base_url: normalize_base(base_url).to_string(),
            account_id,
            ..Self::default()
        }
    }

    /// True when the cursor was written for this server and account.
    pub fn matches(&self, base_url: &str, account_id: u64) -> bool {
        self.account_id == account_id && normalize_base(&self.base_url) == normalize_base(base_url)
    }

    /// Where a resumed session should start: the further of `local` and this
    /// cursor, or just `local` if the cursor belongs elsewhere.
    pub fn resume_point(&self, base_url: &str, account_id: u64, local: u64) -> u64 {
        if !self.matches(base_url, account_id) {
            if self.last_seen_message_id > 0 {
                warn!(
                    cursor_base_url = %self.base_url,
                    cursor_account_id = self.account_id,
                    "ignoring cursor written for a different server or account"
                );
            }
            return local;
        }
        local.max(self.last_seen_message_id)
    }
}

fn normalize_base(base_url: &str) -> &str {
    base_url.trim_end_matches('/')
}

fn io_error(path: &Path, source: io::Error) -> CursorError {
    CursorError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Read a cursor. A missing file is an empty cursor, not an error.
pub fn load(path: &Path) -> Result<FollowCursor, CursorError> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(FollowCursor::default()),
        Err(err) => return Err(io_error(path, err)),
    };
    serde_json::from_slice(&raw).map_err(|source| CursorError::Malformed {
        path: path.display().to_string(),
        source,
    })
}

/// Write `cursor` atomically, stamping version and update time. Returns
/// what was written.
pub fn save(path: &Path, cursor: &FollowCursor) -> Result<FollowCursor, CursorError> {
    let mut stamped = cursor.clone();
    stamped.version = CURSOR_VERSION;
    stamped.updated_at = Some(Utc::now());

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(|e| io_error(dir, e))?;

    let json = serde_json::to_vec_pretty(&stamped).map_err(|e| io_error(path, e.into()))?;
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| io_error(dir, e))?;
    tmp.write_all(&json).map_err(|e| io_error(tmp.path(), e))?;
    tmp.as_file().sync_all().map_err(|e| io_error(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| io_error(path, e.error))?;

    debug!(path = %path.display(), last_seen = stamped.last_seen_message_id, "cursor saved");
    Ok(stamped)
}

/// Delete the cursor file. Returns whether one existed.
pub fn remove(path: &Path) -> Result<bool, CursorError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(io_error(path, err)),
    }
}

/// Coalescing cursor persistence for a running follow session.
///
/// `advance` writes only when the id moved past what is on disk and either
/// nothing was written yet or `min_interval` has passed since the last write.
/// `flush` writes any pending progress unconditionally.
#[derive(Debug)]
pub struct CursorWriter {
    path: PathBuf,
    cursor: FollowCursor,
    pending: u64,
    last_flush: Option<Instant>,
    min_interval: Duration,
}

impl CursorWriter {
    /// `persisted` is the id already on disk (0 when starting fresh).
    pub fn new(path: PathBuf, base_url: &str, account_id: u64, persisted: u64, min_interval: Duration) -> Self {
        let mut cursor = FollowCursor::new(base_url, account_id);
        cursor.last_seen_message_id = persisted;
        Self {
            path,
            cursor,
            pending: persisted,
            last_flush: None,
            min_interval,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn persisted(&self) -> u64 {
        self.cursor.last_seen_message_id
    }

    pub fn pending(&self) -> u64 {
        self.pending
    }

    /// Record progress. Returns whether the file was written.
    pub fn advance(&mut self, message_id: u64) -> Result<bool, CursorError> {
        self.pending = self.pending.max(message_id);
        if self.pending <= self.cursor.last_seen_message_id {
            return Ok(false);
        }
        let due = self
            .last_flush
            .is_none_or(|at| at.elapsed() >= self.min_interval);
        if !due {
            return Ok(false);
        }
        self.write()?;
        Ok(true)
    }

    /// Persist pending progress regardless of the interval.
    pub fn flush(&mut self) -> Result<bool, CursorError> {
        if self.pending <= self.cursor.last_seen_message_id {
            return Ok(false);
        }
        self.write()?;
        info!(path = %self.path.display(), last_seen = self.pending, "cursor flushed");
        Ok(true)
    }

    fn write(&mut self) -> Result<(), CursorError> {
        let mut next = self.cursor.clone();
        next.last_seen_message_id = self.pending;
        self.cursor = save(&self.path, &next)?;
        self.last_flush = Some(Instant::now());
        Ok(())
    }
}
