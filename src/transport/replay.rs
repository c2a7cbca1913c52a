//! Replay protection for v2 envelopes.
//!
//! Each decrypted v2 request carries a `timestamp` and a `nonce` in its
//! metadata. The guard enforces the freshness window, remembers nonces it
//! has accepted, and strips both fields before the metadata reaches any
//! handler. The cache is in-memory only; a restart forgets the window.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde_json::{Map, Value};

use super::TransportError;

pub const MIN_NONCE_LEN: usize = 8;
pub const MAX_NONCE_LEN: usize = 256;

/// First-seen nonce cache with a TTL freshness window.
#[derive(Debug)]
pub struct ReplayGuard {
    ttl_ms: u64,
    skew_ms: u64,
    seen: Mutex<HashMap<String, u64>>,
}

impl ReplayGuard {
    pub fn new(ttl: Duration, clock_skew: Duration) -> Self {
        Self {
            ttl_ms: ttl.as_millis() as u64,
            skew_ms: clock_skew.as_millis() as u64,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Validate and strip the replay fields from a decrypted metadata object.
    ///
    /// First-seen wins: the nonce is recorded before returning, so a
    /// concurrent duplicate always loses.
    pub fn validate(&self, metadata: &mut Map<String, Value>) -> Result<(), TransportError> {
        self.validate_at(metadata, now_ms())
    }

    fn validate_at(
        &self,
        metadata: &mut Map<String, Value>,
        now_ms: u64,
    ) -> Result<(), TransportError> {
        // Strip both fields regardless of outcome.
        let timestamp = metadata.remove("timestamp");
        let nonce = metadata.remove("nonce");

        let timestamp = timestamp
            .as_ref()
            .and_then(Value::as_i64)
            .ok_or_else(|| TransportError::Replay("timestamp must be an integer".into()))?;
        if timestamp < 0 {
            return Err(TransportError::Replay("timestamp must be an integer".into()));
        }
        let timestamp = timestamp as u64;

        if timestamp + self.ttl_ms < now_ms {
            return Err(TransportError::Replay("timestamp expired".into()));
        }
        if timestamp > now_ms + self.skew_ms {
            return Err(TransportError::Replay("timestamp is in the future".into()));
        }

        let nonce = match nonce {
            Some(Value::String(s)) => s,
            _ => return Err(TransportError::Replay("nonce must be a string".into())),
        };
        if nonce.len() < MIN_NONCE_LEN || nonce.len() > MAX_NONCE_LEN {
            return Err(TransportError::Replay(format!(
                "nonce length must be between {MIN_NONCE_LEN} and {MAX_NONCE_LEN}"
            )));
        }

        let mut seen = self.seen.lock();
        if seen.contains_key(&nonce) {
            return Err(TransportError::Replay("nonce already used".into()));
        }
        seen.insert(nonce, timestamp);
        Ok(())
    }

    /// Drop nonces whose timestamps have aged out of the TTL window.
    pub fn sweep(&self) -> usize {
        self.sweep_at(now_ms())
    }

    fn sweep_at(&self, now_ms: u64) -> usize {
        let mut seen = self.seen.lock();
        let before = seen.len();
        seen.retain(|_, ts| *ts + self.ttl_ms >= now_ms);
        before - seen.len()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.seen.lock().len()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis() as u64
}
