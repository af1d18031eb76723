//! Durable ingestion state
//!
//! - [`Cursor`]: the watermark, `{"last_image_id": N}`, rewritten atomically
//!   after every image
//! - [`DeadLetterLog`]: JSON lines naming images that failed permanently

use crate::source::ImageId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Cursor file name inside the state directory
pub const CURSOR_FILE: &str = "biocode_cursor.json";

/// Dead-letter file name inside the state directory
pub const DEAD_LETTER_FILE: &str = "biocode_dead_letter.jsonl";

#[derive(Debug, Serialize, Deserialize)]
struct CursorRecord {
    last_image_id: ImageId,
}

/// Highest source image id fully attempted
#[derive(Debug)]
pub struct Cursor {
    path: PathBuf,
    last_image_id: ImageId,
}

impl Cursor {
    /// Load the cursor from `state_dir`, starting at the origin if absent
    ///
    /// # Errors
    /// Returns error if the file exists but cannot be read or parsed
    pub fn load(state_dir: &Path) -> Result<Self, CursorError> {
        let path = state_dir.join(CURSOR_FILE);
        let last_image_id = match fs::read(&path) {
            Ok(bytes) => {
                let record: CursorRecord =
                    serde_json::from_slice(&bytes).map_err(|source| CursorError::Corrupt {
                        path: path.clone(),
                        source,
                    })?;
                record.last_image_id
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            last_image_id,
        })
    }

    /// Cursor at the origin, not yet written
    #[must_use]
    pub fn origin(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(CURSOR_FILE),
            last_image_id: 0,
        }
    }

    /// Current watermark
    #[inline]
    #[must_use]
    pub fn watermark(&self) -> ImageId {
        self.last_image_id
    }

    /// File backing the cursor
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Move the watermark to `image_id` and persist it
    ///
    /// The watermark never moves backwards; an older id is ignored and
    /// `Ok(false)` returned.
    ///
    /// # Errors
    /// Returns error if the file cannot be written
    pub fn advance(&mut self, image_id: ImageId) -> Result<bool, CursorError> {
        if image_id <= self.last_image_id {
            return Ok(false);
        }
        self.persist(image_id)?;
        self.last_image_id = image_id;
        Ok(true)
    }

    /// Rewind to the origin and persist
    ///
    /// # Errors
    /// Returns error if the file cannot be written
    pub fn reset(&mut self) -> Result<(), CursorError> {
        self.persist(0)?;
        self.last_image_id = 0;
        Ok(())
    }

    fn persist(&self, last_image_id: ImageId) -> Result<(), CursorError> {
        let record = serde_json::to_vec(&CursorRecord { last_image_id })
            .map_err(|source| CursorError::Corrupt {
                path: self.path.clone(),
                source,
            })?;
        write_atomic(&self.path, &record)
    }
}

/// Replace `path` with `bytes` through a temp file in the same directory
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CursorError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| CursorError::Io(e.error))?;
    Ok(())
}

/// One permanently failed image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Failed image
    pub image_id: ImageId,
    /// Failure description
    pub reason: String,
    /// When the failure was recorded
    pub timestamp: DateTime<Utc>,
}

/// Append-only JSON-lines log of failed images
#[derive(Debug, Clone)]
pub struct DeadLetterLog {
    path: PathBuf,
}

impl DeadLetterLog {
    /// Log inside `state_dir`
    #[must_use]
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(DEAD_LETTER_FILE),
        }
    }

    /// File backing the log
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record
    ///
    /// # Errors
    /// Returns error if the file cannot be opened or written
    pub fn append(&self, image_id: ImageId, reason: &str) -> Result<DeadLetter, CursorError> {
        let letter = DeadLetter {
            image_id,
            reason: reason.to_string(),
            timestamp: Utc::now(),
        };
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut line = serde_json::to_string(&letter).map_err(|source| CursorError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        line.push('\n');

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(letter)
    }

    /// All records, oldest first; unparseable lines are skipped
    ///
    /// # Errors
    /// Returns error if the file exists but cannot be read
    pub fn read_all(&self) -> Result<Vec<DeadLetter>, CursorError> {
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut letters = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(letter) => letters.push(letter),
                Err(e) => tracing::warn!(path = %self.path.display(), error = %e, "skipping bad dead-letter line"),
            }
        }
        Ok(letters)
    }

    /// Number of records
    ///
    /// # Errors
    /// Returns error if the file exists but cannot be read
    pub fn count(&self) -> Result<usize, CursorError> {
        Ok(self.read_all()?.len())
    }
}

/// Durable state failures
#[derive(Debug, thiserror::Error)]
pub enum CursorError {
    /// Filesystem failure
    #[error("state I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// File content is not the expected JSON
    #[error("corrupt state file {}: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn missing_cursor_starts_at_origin() {
        let dir = tempfile::tempdir().unwrap();
        let cursor = Cursor::load(dir.path()).unwrap();
        assert_eq!(cursor.watermark(), 0);
        assert!(!cursor.path().exists());
    }

    #[test]
    fn advance_persists_wire_format() {
        let dir = tempfile::tempdir().unwrap();
        let mut cursor = Cursor::load(dir.path()).unwrap();
        assert!(cursor.advance(7).unwrap());

        let text = fs::read_to_string(dir.path().join(CURSOR_FILE)).unwrap();
        assert_eq!(text, r#"{"last_image_id":7}"#);
        assert_eq!(Cursor::load(dir.path()).unwrap().watermark(), 7);
    }

    #[test]
    fn watermark_never_moves_backwards() {
        let dir = tempfile::tempdir().unwrap();
        let mut cursor = Cursor::load(dir.path()).unwrap();
        cursor.advance(10).unwrap();
        assert!(!cursor.advance(3).unwrap());
        assert!(!cursor.advance(10).unwrap());
        assert_eq!(Cursor::load(dir.path()).unwrap().watermark(), 10);
    }

    #[test]
    fn reset_rewinds_to_origin() {
        let dir = tempfile::tempdir().unwrap();
        let mut cursor = Cursor::load(dir.path()).unwrap();
        cursor.advance(42).unwrap();
        cursor.reset().unwrap();
        assert_eq!(cursor.watermark(), 0);
        assert_eq!(Cursor::load(dir.path()).unwrap().watermark(), 0);
    }

    #[test]
    fn corrupt_cursor_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CURSOR_FILE), b"{not json").unwrap();
        assert!(matches!(Cursor::load(dir.path()), Err(CursorError::Corrupt { .. })));
    }

    #[test]
    fn state_dir_is_created_on_first_write() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let mut cursor = Cursor::load(&nested).unwrap();
        cursor.advance(1).unwrap();
        assert!(nested.join(CURSOR_FILE).exists());
    }

    #[test]
    fn dead_letters_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let log = DeadLetterLog::new(dir.path());
        assert_eq!(log.count().unwrap(), 0);

        log.append(3, "bad plane").unwrap();
        log.append(9, "short read").unwrap();
        fs::OpenOptions::new()
            .append(true)
            .open(log.path())
            .unwrap()
            .write_all(b"garbage\n")
            .unwrap();

        let letters = log.read_all().unwrap();
        assert_eq!(letters.len(), 2);
        assert_eq!(letters[0].image_id, 3);
        assert_eq!(letters[1].reason, "short read");
    }

    proptest! {
        #[test]
        fn prop_watermark_is_running_max(ids in proptest::collection::vec(0u64..1_000, 0..40)) {
            let dir = tempfile::tempdir().unwrap();
            let mut cursor = Cursor::load(dir.path()).unwrap();
            let mut expected = 0;
            for id in ids {
                let before = cursor.watermark();
                cursor.advance(id).unwrap();
                expected = expected.max(id);
                prop_assert!(cursor.watermark() >= before);
                prop_assert_eq!(cursor.watermark(), expected);
            }
            prop_assert_eq!(Cursor::load(dir.path()).unwrap().watermark(), expected);
        }
    }
}
