//! File store
//!
//! Terminal destination for sessions finalized as durable files: the
//! reassembled payload is size- and digest-checked, then written atomically
//! to a dated path `<root>/YYYY/MM/DD/<sessionId>-<sanitized name>`.

use std::path::PathBuf;

use chrono::{Datelike, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::RelayError;
use crate::sessions::SessionStore;

/// Outcome of a successful store, recorded in the session details.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredFile {
    pub stored_path: String,
    pub stored_size: u64,
}

/// Writes verified payloads under a dated directory tree.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    max_file_size: u64,
}

impl FileStore {
    pub fn new(root: PathBuf, max_file_size: u64) -> Self {
        Self {
            root,
            max_file_size,
        }
    }

    /// Reassemble a session and persist it as a verified file.
    pub fn store(
        &self,
        sessions: &SessionStore,
        session_id: &str,
        file_name: &str,
        expected_size: u64,
        expected_sha256: &str,
    ) -> Result<StoredFile, RelayError> {
        if !is_hex_sha256(expected_sha256) {
            return Err(RelayError::InvalidInput(
                "sha256 must be 64 hex characters".into(),
            ));
        }

        let data = sessions.reassemble(session_id)?;
        let actual_size = data.len() as u64;
        if actual_size != expected_size {
            return Err(RelayError::SizeMismatch {
                expected: expected_size,
                actual: actual_size,
            });
        }
        if actual_size > self.max_file_size {
            return Err(RelayError::FileTooLarge {
                size: actual_size,
                max: self.max_file_size,
            });
        }

        let digest = hex::encode(Sha256::digest(&data));
        if !digest.eq_ignore_ascii_case(expected_sha256) {
            return Err(RelayError::Sha256Mismatch);
        }

        let now = Utc::now();
        let dir = self
            .root
            .join(format!("{:04}", now.year()))
            .join(format!("{:02}", now.month()))
            .join(format!("{:02}", now.day()));
        let dest = dir.join(format!("{}-{}", session_id, sanitize_file_name(file_name)));
        if dest.exists() {
            return Err(RelayError::FileExists(dest.display().to_string()));
        }
        std::fs::create_dir_all(&dir)?;

        // Temp-and-rename keeps partially written files out of the tree;
        // the no-clobber persist closes the check-then-write race.
        let temp = tempfile::NamedTempFile::new_in(&dir)?;
        std::fs::write(temp.path(), &data)?;
        temp.persist_noclobber(&dest)
            .map_err(|e| match e.error.kind() {
                std::io::ErrorKind::AlreadyExists => {
                    RelayError::FileExists(dest.display().to_string())
                }
                _ => RelayError::Internal(e.to_string()),
            })?;

        info!(
            target: "storage",
            session_id,
            path = %dest.display(),
            size = actual_size,
            "file stored"
        );
        Ok(StoredFile {
            stored_path: dest.display().to_string(),
            stored_size: actual_size,
        })
    }
}

/// Whether a string is a well-formed hex SHA-256 digest (case-insensitive).
pub fn is_hex_sha256(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Reduce a client-supplied file name to a safe basename: strip any
/// directory components, replace control and reserved characters with `_`,
/// collapse `_` runs, trim `_` and `.` from the ends, and never return an
/// empty name.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(name);

    let mut out = String::with_capacity(base.len());
    let mut last_was_underscore = false;
    for c in base.chars() {
        let mapped = if c.is_ascii_control()
            || matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|')
        {
            '_'
        } else {
            c
        };
        if mapped == '_' {
            if last_was_underscore {
                continue;
            }
            last_was_underscore = true;
        } else {
            last_was_underscore = false;
        }
        out.push(mapped);
    }

    let trimmed = out.trim_matches(['_', '.']);
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    const MAX: u64 = 10 * 1024 * 1024;

    fn sessions(dir: &TempDir) -> SessionStore {
        SessionStore::new(dir.path().join("sessions"), Duration::from_secs(600))
    }

    fn upload(store: &SessionStore, session_id: &str, chunks: &[&[u8]]) {
        for (index, chunk) in chunks.iter().enumerate() {
            store
                .store_chunk(session_id, index as u32, chunks.len() as u32, chunk)
                .unwrap();
        }
        assert!(store.start_processing(session_id, "Processing").unwrap());
    }

    fn sha_hex(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    #[test]
    fn test_store_happy_path() {
        let dir = TempDir::new().unwrap();
        let sessions = sessions(&dir);
        let files = FileStore::new(dir.path().join("files"), MAX);

        upload(&sessions, "s6", &[b"hello ", b"world"]);
        let stored = files
            .store(&sessions, "s6", "report.tar.gz", 11, &sha_hex(b"hello world"))
            .unwrap();

        assert_eq!(stored.stored_size, 11);
        let path = PathBuf::from(&stored.stored_path);
        assert!(path.exists());
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("s6-report.tar.gz"));

        // Dated layout: <root>/YYYY/MM/DD/<file>.
        let rel = path.strip_prefix(dir.path().join("files")).unwrap();
        assert_eq!(rel.components().count(), 4);
    }

    #[test]
    fn test_digest_compare_is_case_insensitive() {
        let dir = TempDir::new().unwrap();
        let sessions = sessions(&dir);
        let files = FileStore::new(dir.path().join("files"), MAX);

        upload(&sessions, "s1", &[b"data"]);
        files
            .store(&sessions, "s1", "f.bin", 4, &sha_hex(b"data").to_uppercase())
            .unwrap();
    }

    #[test]
    fn test_size_mismatch() {
        let dir = TempDir::new().unwrap();
        let sessions = sessions(&dir);
        let files = FileStore::new(dir.path().join("files"), MAX);

        upload(&sessions, "s1", &[b"data"]);
        let err = files
            .store(&sessions, "s1", "f.bin", 5, &sha_hex(b"data"))
            .unwrap_err();
        assert_eq!(err.code(), "SIZE_MISMATCH");
    }

    #[test]
    fn test_file_too_large() {
        let dir = TempDir::new().unwrap();
        let sessions = sessions(&dir);
        let files = FileStore::new(dir.path().join("files"), 3);

        upload(&sessions, "s1", &[b"data"]);
        let err = files
            .store(&sessions, "s1", "f.bin", 4, &sha_hex(b"data"))
            .unwrap_err();
        assert_eq!(err.code(), "FILE_TOO_LARGE");
    }

    #[test]
    fn test_single_byte_flip_changes_verdict() {
        let dir = TempDir::new().unwrap();
        let sessions = sessions(&dir);
        let files = FileStore::new(dir.path().join("files"), MAX);

        // Digest of a one-byte mutation of the payload must be rejected.
        upload(&sessions, "s1", &[b"data"]);
        let err = files
            .store(&sessions, "s1", "f.bin", 4, &sha_hex(b"dbta"))
            .unwrap_err();
        assert_eq!(err.code(), "SHA256_MISMATCH");
    }

    #[test]
    fn test_bad_digest_shape() {
        let dir = TempDir::new().unwrap();
        let sessions = sessions(&dir);
        let files = FileStore::new(dir.path().join("files"), MAX);

        upload(&sessions, "s1", &[b"data"]);
        let err = files
            .store(&sessions, "s1", "f.bin", 4, "zz")
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
    }

    #[test]
    fn test_destination_collision() {
        let dir = TempDir::new().unwrap();
        let sessions = sessions(&dir);
        let files = FileStore::new(dir.path().join("files"), MAX);

        upload(&sessions, "s1", &[b"data"]);
        let stored = files
            .store(&sessions, "s1", "f.bin", 4, &sha_hex(b"data"))
            .unwrap();

        // A relay restart forgets session metadata, so the same session id
        // can reach the same dated destination again.
        let restarted = SessionStore::new(dir.path().join("sessions2"), Duration::from_secs(600));
        upload(&restarted, "s1", &[b"data"]);
        let err = files
            .store(&restarted, "s1", "f.bin", 4, &sha_hex(b"data"))
            .unwrap_err();
        assert_eq!(err.code(), "FILE_EXISTS");
        assert!(err.to_string().contains(&stored.stored_path));
    }

    #[test]
    fn test_incomplete_session_fails_before_checks() {
        let dir = TempDir::new().unwrap();
        let sessions = sessions(&dir);
        let files = FileStore::new(dir.path().join("files"), MAX);

        sessions.store_chunk("s1", 0, 2, b"da").unwrap();
        assert!(sessions.start_processing("s1", "Processing").unwrap());
        let err = files
            .store(&sessions, "s1", "f.bin", 4, &sha_hex(b"data"))
            .unwrap_err();
        assert_eq!(err.code(), "INCOMPLETE_CHUNKS");
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("report.tar.gz"), "report.tar.gz");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\x\\doc.txt"), "doc.txt");
        assert_eq!(sanitize_file_name("a:b*c?d\"e<f>g|h"), "a_b_c_d_e_f_g_h");
        assert_eq!(sanitize_file_name("a***b"), "a_b");
        assert_eq!(sanitize_file_name("__weird__.txt_"), "weird_.txt");
        assert_eq!(sanitize_file_name("..."), "unnamed");
        assert_eq!(sanitize_file_name(""), "unnamed");
        assert_eq!(sanitize_file_name("x\x00\x1fy"), "x_y");
    }
}
