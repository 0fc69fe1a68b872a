//! On-disk OAuth token storage.
//!
//! One JSON record (`access_token`, `refresh_token`, `expires_at`) lives in a
//! file with mode 0600 inside a directory with mode 0700. Unreadable or
//! unparsable records are treated as absent so a corrupted file degrades to
//! "login required" instead of an error.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Seconds subtracted from `expires_at` when deciding whether a token is usable
pub const EXPIRY_SAFETY_WINDOW_SECS: i64 = 60;

/// Source of "now" in unix seconds.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub access_token: String,
    pub refresh_token: String,
    /// Absolute unix timestamp, seconds
    pub expires_at: i64,
}

impl TokenRecord {
    pub fn is_expired_at(&self, now: i64) -> bool {
        now >= self.expires_at - EXPIRY_SAFETY_WINDOW_SECS
    }
}

/// Secret-free summary of the stored token, safe to expose over HTTP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenStatus {
    pub present: bool,
    pub expired: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seconds_remaining: Option<i64>,
}

#[derive(Clone)]
pub struct TokenStore {
    path: PathBuf,
    clock: Clock,
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore").field("path", &self.path).finish()
    }
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_clock(path, Arc::new(now_secs))
    }

    pub fn with_clock(path: impl Into<PathBuf>, clock: Clock) -> Self {
        Self {
            path: path.into(),
            clock,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn now(&self) -> i64 {
        (self.clock)()
    }

    /// Persist a fresh token pair, replacing any previous record.
    pub fn save(&self, access_token: &str, refresh_token: &str, expires_in: i64) -> io::Result<()> {
        let record = TokenRecord {
            access_token: access_token.to_string(),
            refresh_token: refresh_token.to_string(),
            expires_at: self.now() + expires_in,
        };
        let contents = serde_json::to_string_pretty(&record)?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            ensure_private_dir(parent)?;
        }

        // Write a sibling temp file then rename over the record so readers
        // never observe a half-written file.
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = open_private(&tmp)?;
            file.write_all(contents.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        set_private_file_mode(&self.path)?;

        debug!(path = %self.path.display(), expires_at = record.expires_at, "saved tokens");
        Ok(())
    }

    pub fn load(&self) -> Option<TokenRecord> {
        let contents = fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str(&contents) {
            Ok(record) => Some(record),
            Err(e) => {
                debug!(path = %self.path.display(), "ignoring unparsable token file: {}", e);
                None
            }
        }
    }

    pub fn is_expired(&self) -> bool {
        self.load()
            .map_or(true, |record| record.is_expired_at(self.now()))
    }

    /// The access token, only while it has at least the safety window left.
    pub fn access_token(&self) -> Option<String> {
        let record = self.load()?;
        if record.is_expired_at(self.now()) {
            return None;
        }
        Some(record.access_token)
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.load().map(|record| record.refresh_token)
    }

    /// Remove the record. Missing file is fine.
    pub fn clear(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn status(&self) -> TokenStatus {
        let Some(record) = self.load() else {
            return TokenStatus {
                present: false,
                expired: true,
                expires_at: None,
                seconds_remaining: None,
            };
        };
        let now = self.now();
        let expired = record.is_expired_at(now);
        TokenStatus {
            present: true,
            expired,
            expires_at: Some(record.expires_at),
            seconds_remaining: (!expired).then(|| record.expires_at - now),
        }
    }
}

pub(crate) fn ensure_private_dir(dir: &Path) -> io::Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

fn open_private(path: &Path) -> io::Result<fs::File> {
    let mut opts = fs::OpenOptions::new();
    opts.create(true).truncate(true).write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    opts.open(path)
}

fn set_private_file_mode(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
