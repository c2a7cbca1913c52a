//! Session store
//!
//! Tracks chunked upload sessions: metadata lives in memory, chunk bytes on
//! disk under `<root>/<sessionId>/chunk-<index>.bin`. All mutations go
//! through one mutex so the status state machine is linearizable:
//!
//! ```text
//!   receiving -> complete -> processing -> pushed | stored | failed
//!              (markComplete) (startProcessing, at most once)
//! ```
//!
//! Sessions are ephemeral; a TTL sweep reclaims idle ones together with
//! their on-disk chunks.

pub mod cleanup;

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::RelayError;

/// Status of an upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Chunks are being received.
    Receiving,
    /// Client declared the upload complete.
    Complete,
    /// A finalize job owns the session.
    Processing,
    /// Terminal: pushed to the upstream repository.
    Pushed,
    /// Terminal: stored as a durable file.
    Stored,
    /// Terminal: finalize failed.
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Pushed | Self::Stored | Self::Failed)
    }

    /// Whether the session still accepts chunk writes.
    pub fn accepts_chunks(self) -> bool {
        matches!(self, Self::Receiving | Self::Complete)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Receiving => "receiving",
            Self::Complete => "complete",
            Self::Processing => "processing",
            Self::Pushed => "pushed",
            Self::Stored => "stored",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// In-memory session record. Chunk bytes live on disk.
#[derive(Debug)]
struct SessionEntry {
    total_chunks: u32,
    received: BTreeSet<u32>,
    status: SessionStatus,
    message: String,
    details: Map<String, Value>,
    created_at_ms: u64,
    updated_at_ms: u64,
}

/// Read-only view of a session, for status polling.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: String,
    pub status: SessionStatus,
    pub message: String,
    pub chunks_received: usize,
    pub total_chunks: u32,
    pub details: Map<String, Value>,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Disk-backed store for chunked upload sessions.
#[derive(Debug)]
pub struct SessionStore {
    root: PathBuf,
    ttl: Duration,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionStore {
    pub fn new(root: PathBuf, ttl: Duration) -> Self {
        Self {
            root,
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    fn chunk_path(&self, session_id: &str, index: u32) -> PathBuf {
        self.session_dir(session_id).join(format!("chunk-{index}.bin"))
    }

    /// Persist one chunk, creating the session lazily on the first write.
    ///
    /// Idempotent per `(session, index)`: a rewrite overwrites the bytes on
    /// disk without growing the received set. Returns the number of distinct
    /// chunks received so far.
    pub fn store_chunk(
        &self,
        session_id: &str,
        chunk_index: u32,
        total_chunks: u32,
        bytes: &[u8],
    ) -> Result<usize, RelayError> {
        if total_chunks == 0 {
            return Err(RelayError::InvalidInput(
                "totalChunks must be positive".into(),
            ));
        }
        if chunk_index >= total_chunks {
            return Err(RelayError::InvalidInput(format!(
                "chunkIndex {chunk_index} out of range for {total_chunks} chunks"
            )));
        }

        let mut sessions = self.sessions.lock();
        let now = now_ms();
        let entry = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionEntry {
                total_chunks,
                received: BTreeSet::new(),
                status: SessionStatus::Receiving,
                message: "Receiving chunks".into(),
                details: Map::new(),
                created_at_ms: now,
                updated_at_ms: now,
            });

        if !entry.status.accepts_chunks() {
            return Err(RelayError::SessionCompleted(session_id.to_string()));
        }
        // The first chunk fixes the session geometry.
        if entry.total_chunks != total_chunks {
            return Err(RelayError::InvalidInput(format!(
                "totalChunks mismatch: session expects {}, got {}",
                entry.total_chunks, total_chunks
            )));
        }

        let dir = self.session_dir(session_id);
        fs::create_dir_all(&dir)?;
        fs::write(self.chunk_path(session_id, chunk_index), bytes)?;

        entry.received.insert(chunk_index);
        entry.updated_at_ms = now_ms();
        debug!(
            target: "sessions",
            session_id,
            chunk_index,
            received = entry.received.len(),
            total = entry.total_chunks,
            "chunk stored"
        );
        Ok(entry.received.len())
    }

    /// Transition `receiving -> complete`. Does not verify that all chunks
    /// are present; reassembly does.
    pub fn mark_complete(&self, session_id: &str) -> Result<(), RelayError> {
        let mut sessions = self.sessions.lock();
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| RelayError::SessionNotFound(session_id.to_string()))?;
        match entry.status {
            SessionStatus::Receiving | SessionStatus::Complete => {
                entry.status = SessionStatus::Complete;
                entry.message = "Upload complete".into();
                entry.updated_at_ms = now_ms();
                Ok(())
            }
            _ => Err(RelayError::SessionCompleted(session_id.to_string())),
        }
    }

    /// Atomic compare-and-set into `processing`. Returns `true` exactly once
    /// per session; callers seeing `false` report "already processing".
    pub fn start_processing(
        &self,
        session_id: &str,
        message: &str,
    ) -> Result<bool, RelayError> {
        let mut sessions = self.sessions.lock();
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| RelayError::SessionNotFound(session_id.to_string()))?;
        if !entry.status.accepts_chunks() {
            return Ok(false);
        }
        entry.status = SessionStatus::Processing;
        entry.message = message.to_string();
        entry.updated_at_ms = now_ms();
        Ok(true)
    }

    /// Concatenate all chunks in index order and delete the on-disk
    /// directory. The in-memory record survives for status polling.
    pub fn reassemble(&self, session_id: &str) -> Result<Vec<u8>, RelayError> {
        let (total, dir) = {
            let sessions = self.sessions.lock();
            let entry = sessions
                .get(session_id)
                .ok_or_else(|| RelayError::SessionNotFound(session_id.to_string()))?;
            if entry.received.len() != entry.total_chunks as usize {
                return Err(RelayError::IncompleteChunks {
                    expected: entry.total_chunks,
                    received: entry.received.len(),
                });
            }
            (entry.total_chunks, self.session_dir(session_id))
        };

        // The session is already `processing` here, so chunk writes are
        // rejected and the directory is stable without holding the lock.
        let mut data = Vec::new();
        for index in 0..total {
            let path = self.chunk_path(session_id, index);
            let chunk = fs::read(&path).map_err(|e| {
                RelayError::Internal(format!(
                    "chunk {index} of session {session_id} unreadable: {e}"
                ))
            })?;
            data.extend_from_slice(&chunk);
        }

        if let Err(e) = fs::remove_dir_all(&dir) {
            warn!(target: "sessions", session_id, "failed to remove chunk dir: {e}");
        }

        let mut sessions = self.sessions.lock();
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.updated_at_ms = now_ms();
        }
        Ok(data)
    }

    /// Record an outcome: merges `details_patch` and bumps `updatedAt`.
    /// Best-effort; a swept session is silently ignored.
    pub fn set_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        message: &str,
        details_patch: Map<String, Value>,
    ) {
        let mut sessions = self.sessions.lock();
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.status = status;
            entry.message = message.to_string();
            for (key, value) in details_patch {
                entry.details.insert(key, value);
            }
            entry.updated_at_ms = now_ms();
        }
    }

    /// Best-effort terminal failure: records the error and removes any
    /// remaining on-disk chunks.
    pub fn set_failed(&self, session_id: &str, error: &str) {
        let dir = self.session_dir(session_id);
        {
            let mut sessions = self.sessions.lock();
            let Some(entry) = sessions.get_mut(session_id) else {
                return;
            };
            entry.status = SessionStatus::Failed;
            entry.message = format!("Failed: {error}");
            entry
                .details
                .insert("error".into(), Value::String(error.to_string()));
            entry.updated_at_ms = now_ms();
        }
        if dir.exists() {
            if let Err(e) = fs::remove_dir_all(&dir) {
                warn!(target: "sessions", session_id, "failed to remove chunk dir: {e}");
            }
        }
    }

    /// Snapshot for status polling.
    pub fn get(&self, session_id: &str) -> Option<SessionSnapshot> {
        let sessions = self.sessions.lock();
        sessions.get(session_id).map(|entry| SessionSnapshot {
            session_id: session_id.to_string(),
            status: entry.status,
            message: entry.message.clone(),
            chunks_received: entry.received.len(),
            total_chunks: entry.total_chunks,
            details: entry.details.clone(),
            created_at: entry.created_at_ms,
            updated_at: entry.updated_at_ms,
        })
    }

    /// Remove sessions idle past the TTL along with their chunk
    /// directories. Returns the number of sessions removed.
    pub fn cleanup_expired(&self) -> usize {
        let cutoff = now_ms().saturating_sub(self.ttl.as_millis() as u64);
        let expired: Vec<(String, PathBuf)> = {
            let mut sessions = self.sessions.lock();
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, entry)| entry.updated_at_ms < cutoff)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .map(|id| {
                    sessions.remove(&id);
                    let dir = self.session_dir(&id);
                    (id, dir)
                })
                .collect()
        };

        for (id, dir) in &expired {
            if dir.exists() {
                if let Err(e) = fs::remove_dir_all(dir) {
                    warn!(target: "sessions", session_id = %id, "failed to remove chunk dir: {e}");
                }
            }
            debug!(target: "sessions", session_id = %id, "expired session removed");
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shift a session's `updatedAt` into the past (test support for TTL
    /// behavior).
    #[cfg(test)]
    pub(crate) fn backdate(&self, session_id: &str, by: Duration) {
        let mut sessions = self.sessions.lock();
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.updated_at_ms = entry
                .updated_at_ms
                .saturating_sub(by.as_millis() as u64 + 1);
        }
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    const TTL: Duration = Duration::from_secs(600);

    fn store(dir: &TempDir) -> SessionStore {
        SessionStore::new(dir.path().to_path_buf(), TTL)
    }

    #[test]
    fn test_chunks_any_order_reassemble_in_order() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        for index in [2u32, 0, 1] {
            let bytes = vec![index as u8; 4];
            store.store_chunk("s1", index, 3, &bytes).unwrap();
        }
        let snapshot = store.get("s1").unwrap();
        assert_eq!(snapshot.chunks_received, 3);

        assert!(store.start_processing("s1", "Processing").unwrap());
        let data = store.reassemble("s1").unwrap();
        assert_eq!(data, [0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2]);

        // Reassembly is destructive on disk but keeps the metadata.
        assert!(!dir.path().join("s1").exists());
        assert!(store.get("s1").is_some());
    }

    #[test]
    fn test_duplicate_chunk_is_idempotent_and_last_write_wins() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        assert_eq!(store.store_chunk("s1", 0, 2, b"first").unwrap(), 1);
        assert_eq!(store.store_chunk("s1", 0, 2, b"second").unwrap(), 1);

        let on_disk = fs::read(dir.path().join("s1/chunk-0.bin")).unwrap();
        assert_eq!(on_disk, b"second");
    }

    #[test]
    fn test_total_chunks_is_fixed_by_first_chunk() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        store.store_chunk("s1", 0, 3, b"a").unwrap();
        let err = store.store_chunk("s1", 1, 4, b"b").unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
    }

    #[test]
    fn test_chunk_index_out_of_range() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert!(store.store_chunk("s1", 3, 3, b"x").is_err());
        assert!(store.store_chunk("s1", 0, 0, b"x").is_err());
    }

    #[test]
    fn test_start_processing_exactly_once_under_contention() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(store(&dir));
        store.store_chunk("s1", 0, 1, b"x").unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                store.start_processing("s1", "Processing").unwrap()
            }));
        }
        let wins: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(wins, 1);
    }

    #[test]
    fn test_chunk_rejected_after_finalize_starts() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.store_chunk("s1", 0, 2, b"x").unwrap();
        assert!(store.start_processing("s1", "Processing").unwrap());

        let err = store.store_chunk("s1", 1, 2, b"y").unwrap_err();
        assert_eq!(err.code(), "SESSION_COMPLETED");

        store.set_failed("s1", "boom");
        let err = store.store_chunk("s1", 1, 2, b"y").unwrap_err();
        assert_eq!(err.code(), "SESSION_COMPLETED");
    }

    #[test]
    fn test_mark_complete_transitions_and_guards() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        assert_eq!(
            store.mark_complete("missing").unwrap_err().code(),
            "SESSION_NOT_FOUND"
        );

        store.store_chunk("s1", 0, 2, b"x").unwrap();
        store.mark_complete("s1").unwrap();
        assert_eq!(store.get("s1").unwrap().status, SessionStatus::Complete);
        // Idempotent.
        store.mark_complete("s1").unwrap();

        assert!(store.start_processing("s1", "Processing").unwrap());
        assert_eq!(
            store.mark_complete("s1").unwrap_err().code(),
            "SESSION_COMPLETED"
        );
    }

    #[test]
    fn test_mark_complete_does_not_require_all_chunks() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.store_chunk("s1", 0, 3, b"x").unwrap();
        store.mark_complete("s1").unwrap();

        assert!(store.start_processing("s1", "Processing").unwrap());
        let err = store.reassemble("s1").unwrap_err();
        assert_eq!(err.code(), "INCOMPLETE_CHUNKS");
        assert_eq!(err.to_string(), "Expected 3 chunks, received 1");
    }

    #[test]
    fn test_set_failed_records_error_and_cleans_disk() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.store_chunk("s1", 0, 2, b"x").unwrap();
        assert!(dir.path().join("s1").exists());

        store.set_failed("s1", "Expected 2 chunks, received 1");
        let snapshot = store.get("s1").unwrap();
        assert_eq!(snapshot.status, SessionStatus::Failed);
        assert_eq!(
            snapshot.details["error"],
            Value::String("Expected 2 chunks, received 1".into())
        );
        assert!(!dir.path().join("s1").exists());

        // Unknown session is silently ignored.
        store.set_failed("missing", "whatever");
    }

    #[test]
    fn test_set_status_merges_details() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.store_chunk("s1", 0, 1, b"x").unwrap();

        let mut patch = Map::new();
        patch.insert("commitSha".into(), Value::String("abc123".into()));
        store.set_status("s1", SessionStatus::Pushed, "Pushed", patch);

        let mut patch2 = Map::new();
        patch2.insert("commitUrl".into(), Value::String("https://x".into()));
        store.set_status("s1", SessionStatus::Pushed, "Pushed", patch2);

        let snapshot = store.get("s1").unwrap();
        assert_eq!(snapshot.details["commitSha"], "abc123");
        assert_eq!(snapshot.details["commitUrl"], "https://x");
    }

    #[test]
    fn test_cleanup_expired_removes_session_and_disk() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.store_chunk("old", 0, 1, b"x").unwrap();
        store.store_chunk("fresh", 0, 1, b"y").unwrap();

        store.backdate("old", TTL);
        let removed = store.cleanup_expired();
        assert_eq!(removed, 1);
        assert!(store.get("old").is_none());
        assert!(store.get("fresh").is_some());
        assert!(!dir.path().join("old").exists());
        assert!(dir.path().join("fresh").exists());
    }
}
