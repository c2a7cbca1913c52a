//! Transport envelope encryption.
//!
//! Every request body reaches the relay wrapped in an application-layer
//! envelope, independent of the TLS channel. Two formats are supported:
//!
//! - **v1**: `iv(12) || authTag(16) || ciphertext`, AES-256-GCM under a
//!   static symmetric key shared with the client.
//! - **v2**: detected by the 4-byte magic `AWR2`. The client generates an
//!   ephemeral X25519 key, derives a content key via HKDF-SHA256 over the
//!   ECDH shared secret, and binds the whole envelope header as AEAD
//!   associated data.
//!
//! The decrypted plaintext is a frame: `metadataLen(4 BE) || metadataJson ||
//! binaryData`. Sealing counterparts ([`seal_v1`]/[`seal_v2`]) are the
//! client-side reference implementation used by the companion uploader and
//! the test suite.

pub mod keys;
pub mod replay;

use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use serde_json::{Map, Value};
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::RelayError;
use keys::{KeyError, TransportKey};

/// Magic bytes that open every v2 envelope.
pub const ENVELOPE_MAGIC: &[u8; 4] = b"AWR2";

const ENVELOPE_VERSION: u8 = 2;
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;
/// Fixed portion of the v2 header: magic + version + kidLen + ephKeyLen + iv.
const V2_FIXED_HEADER_LEN: usize = 4 + 1 + 1 + 2 + IV_LEN;

/// Domain-separation prefix for the HKDF info string.
const HKDF_INFO_PREFIX: &[u8] = b"relay-transport-v2";

// ============================================================================
// Mode
// ============================================================================

/// Which envelope formats the server accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CryptoMode {
    /// Legacy symmetric envelopes only.
    V1,
    /// Both formats accepted.
    #[default]
    Compat,
    /// Hybrid envelopes only.
    V2,
}

impl CryptoMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "v1" => Some(Self::V1),
            "compat" => Some(Self::Compat),
            "v2" => Some(Self::V2),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V1 => "v1",
            Self::Compat => "compat",
            Self::V2 => "v2",
        }
    }
}

impl std::fmt::Display for CryptoMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("envelope too short")]
    Truncated,

    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown key id")]
    UnknownKeyId,

    #[error("{0} envelopes are not accepted in {1} mode")]
    ModeRejected(&'static str, CryptoMode),

    #[error("integrity check failed")]
    Integrity,

    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("malformed plaintext frame: {0}")]
    BadFrame(String),

    #[error("replay check failed: {0}")]
    Replay(String),

    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Every transport failure surfaces to clients as `DECRYPTION_FAILED`.
impl From<TransportError> for RelayError {
    fn from(err: TransportError) -> Self {
        RelayError::Decryption(err.to_string())
    }
}

// ============================================================================
// Frame
// ============================================================================

/// Which envelope format a decrypted frame arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeVersion {
    V1,
    V2,
}

/// A decrypted request: the metadata object that becomes the request body,
/// plus the out-of-band binary attachment.
#[derive(Debug)]
pub struct Frame {
    pub metadata: Map<String, Value>,
    pub binary: Vec<u8>,
    pub version: EnvelopeVersion,
}

/// Parse the plaintext frame layout: `metadataLen(4 BE) || json || binary`.
fn parse_frame(plaintext: &[u8], version: EnvelopeVersion) -> Result<Frame, TransportError> {
    if plaintext.len() < 4 {
        return Err(TransportError::BadFrame(
            "missing metadata length prefix".into(),
        ));
    }
    let meta_len = u32::from_be_bytes([plaintext[0], plaintext[1], plaintext[2], plaintext[3]])
        as usize;
    let rest = &plaintext[4..];
    if meta_len > rest.len() {
        return Err(TransportError::BadFrame(format!(
            "metadata length {} exceeds frame size {}",
            meta_len,
            rest.len()
        )));
    }

    let value: Value = serde_json::from_slice(&rest[..meta_len])
        .map_err(|e| TransportError::BadFrame(format!("metadata is not valid JSON: {e}")))?;
    let metadata = match value {
        Value::Object(map) => map,
        _ => {
            return Err(TransportError::BadFrame(
                "metadata must be a JSON object".into(),
            ))
        }
    };

    Ok(Frame {
        metadata,
        binary: rest[meta_len..].to_vec(),
        version,
    })
}

/// Serialize a metadata object and binary payload into the frame layout.
fn build_frame(metadata: &Value, binary: &[u8]) -> Vec<u8> {
    let meta_bytes = serde_json::to_vec(metadata).expect("metadata serializes");
    let mut frame = Vec::with_capacity(4 + meta_bytes.len() + binary.len());
    frame.extend_from_slice(&(meta_bytes.len() as u32).to_be_bytes());
    frame.extend_from_slice(&meta_bytes);
    frame.extend_from_slice(binary);
    frame
}

// ============================================================================
// Opening
// ============================================================================

/// Server-side envelope decryption. Holds the accepted mode plus whichever
/// keys that mode requires; both are read-only after startup.
#[derive(Debug, Clone)]
pub struct EnvelopeOpener {
    mode: CryptoMode,
    symmetric_key: Option<Zeroizing<[u8; 32]>>,
    transport_key: Option<Arc<TransportKey>>,
}

impl EnvelopeOpener {
    pub fn new(
        mode: CryptoMode,
        symmetric_key: Option<Zeroizing<[u8; 32]>>,
        transport_key: Option<Arc<TransportKey>>,
    ) -> Self {
        Self {
            mode,
            symmetric_key,
            transport_key,
        }
    }

    pub fn mode(&self) -> CryptoMode {
        self.mode
    }

    /// Detect the envelope format and decrypt to a [`Frame`].
    pub fn open(&self, payload: &[u8]) -> Result<Frame, TransportError> {
        if payload.len() >= ENVELOPE_MAGIC.len() && payload[..4] == ENVELOPE_MAGIC[..] {
            self.open_v2(payload)
        } else {
            self.open_v1(payload)
        }
    }

    fn open_v1(&self, payload: &[u8]) -> Result<Frame, TransportError> {
        if self.mode == CryptoMode::V2 {
            return Err(TransportError::ModeRejected("v1", self.mode));
        }
        let key = self
            .symmetric_key
            .as_ref()
            .ok_or_else(|| TransportError::Malformed("v1 key not configured".into()))?;

        if payload.len() < IV_LEN + TAG_LEN + 1 {
            return Err(TransportError::Truncated);
        }
        let iv = &payload[..IV_LEN];
        let tag = &payload[IV_LEN..IV_LEN + TAG_LEN];
        let ciphertext = &payload[IV_LEN + TAG_LEN..];

        // The aead crate expects ciphertext || tag.
        let mut combined = Vec::with_capacity(ciphertext.len() + TAG_LEN);
        combined.extend_from_slice(ciphertext);
        combined.extend_from_slice(tag);

        let key_bytes: &[u8; 32] = key;
        let cipher = Aes256Gcm::new(key_bytes.into());
        let plaintext = cipher
            .decrypt(Nonce::from_slice(iv), combined.as_slice())
            .map_err(|_| TransportError::Integrity)?;

        parse_frame(&plaintext, EnvelopeVersion::V1)
    }

    fn open_v2(&self, payload: &[u8]) -> Result<Frame, TransportError> {
        if self.mode == CryptoMode::V1 {
            return Err(TransportError::ModeRejected("v2", self.mode));
        }
        let key = self
            .transport_key
            .as_ref()
            .ok_or_else(|| TransportError::Malformed("v2 key not configured".into()))?;

        if payload.len() < V2_FIXED_HEADER_LEN {
            return Err(TransportError::Truncated);
        }
        let version = payload[4];
        if version != ENVELOPE_VERSION {
            return Err(TransportError::UnsupportedVersion(version));
        }
        let kid_len = payload[5] as usize;
        let eph_len = u16::from_be_bytes([payload[6], payload[7]]) as usize;
        let header_len = V2_FIXED_HEADER_LEN + kid_len + eph_len;
        if payload.len() < header_len + TAG_LEN + 1 {
            return Err(TransportError::Truncated);
        }

        let iv = &payload[8..8 + IV_LEN];
        let kid = &payload[V2_FIXED_HEADER_LEN..V2_FIXED_HEADER_LEN + kid_len];
        let eph_der = &payload[V2_FIXED_HEADER_LEN + kid_len..header_len];

        // Wrong kid means "not my key" - never attempt the decrypt.
        if kid != key.key_id().as_bytes() {
            return Err(TransportError::UnknownKeyId);
        }

        let eph_public = keys::parse_spki_public(eph_der)?;
        let shared = key.diffie_hellman(&eph_public);
        if !shared.was_contributory() {
            return Err(TransportError::Malformed(
                "ephemeral key yields an all-zero shared secret".into(),
            ));
        }

        let content_key = derive_content_key(
            shared.as_bytes(),
            iv,
            kid,
            eph_der,
            key.public_spki(),
        );

        let header = &payload[..header_len];
        let tag = &payload[header_len..header_len + TAG_LEN];
        let ciphertext = &payload[header_len + TAG_LEN..];

        let mut combined = Vec::with_capacity(ciphertext.len() + TAG_LEN);
        combined.extend_from_slice(ciphertext);
        combined.extend_from_slice(tag);

        let key_bytes: &[u8; 32] = &content_key;
        let cipher = Aes256Gcm::new(key_bytes.into());
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(iv),
                Payload {
                    msg: combined.as_slice(),
                    aad: header,
                },
            )
            .map_err(|_| TransportError::Integrity)?;

        parse_frame(&plaintext, EnvelopeVersion::V2)
    }
}

/// HKDF-SHA256 content key: ikm = ECDH shared secret, salt = iv,
/// info = prefix || 0 || kid || 0 || ephPubDer || 0 || serverPubDer.
fn derive_content_key(
    shared: &[u8],
    iv: &[u8],
    kid: &[u8],
    eph_der: &[u8],
    server_der: &[u8],
) -> Zeroizing<[u8; 32]> {
    let mut info =
        Vec::with_capacity(HKDF_INFO_PREFIX.len() + kid.len() + eph_der.len() + server_der.len() + 3);
    info.extend_from_slice(HKDF_INFO_PREFIX);
    info.push(0);
    info.extend_from_slice(kid);
    info.push(0);
    info.extend_from_slice(eph_der);
    info.push(0);
    info.extend_from_slice(server_der);

    let hk = Hkdf::<Sha256>::new(Some(iv), shared);
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(&info, &mut *okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    okm
}

// ============================================================================
// Sealing (client side)
// ============================================================================

/// Seal a v1 envelope: `iv || tag || ciphertext` under the shared symmetric
/// key.
pub fn seal_v1(
    key: &[u8; 32],
    metadata: &Value,
    binary: &[u8],
) -> Result<Vec<u8>, TransportError> {
    let frame = build_frame(metadata, binary);

    let mut iv = [0u8; IV_LEN];
    getrandom::fill(&mut iv)
        .map_err(|e| TransportError::Malformed(format!("random iv: {e}")))?;

    let cipher = Aes256Gcm::new(key.into());
    let sealed = cipher
        .encrypt(Nonce::from_slice(&iv), frame.as_slice())
        .map_err(|_| TransportError::Integrity)?;
    let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

    let mut out = Vec::with_capacity(IV_LEN + TAG_LEN + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(tag);
    out.extend_from_slice(ciphertext);
    Ok(out)
}

/// Seal a v2 envelope for the given server public key and key id.
pub fn seal_v2(
    kid: &str,
    server_public: &PublicKey,
    metadata: &Value,
    binary: &[u8],
) -> Result<Vec<u8>, TransportError> {
    if kid.is_empty() || kid.len() > u8::MAX as usize {
        return Err(TransportError::Malformed(
            "kid must be between 1 and 255 bytes".into(),
        ));
    }
    let frame = build_frame(metadata, binary);

    let mut eph_scalar = Zeroizing::new([0u8; 32]);
    getrandom::fill(&mut *eph_scalar)
        .map_err(|e| TransportError::Malformed(format!("random ephemeral key: {e}")))?;
    let eph_secret = StaticSecret::from(*eph_scalar);
    let eph_der = keys::encode_spki(&PublicKey::from(&eph_secret));

    let mut iv = [0u8; IV_LEN];
    getrandom::fill(&mut iv)
        .map_err(|e| TransportError::Malformed(format!("random iv: {e}")))?;

    let mut header = Vec::with_capacity(V2_FIXED_HEADER_LEN + kid.len() + eph_der.len());
    header.extend_from_slice(ENVELOPE_MAGIC);
    header.push(ENVELOPE_VERSION);
    header.push(kid.len() as u8);
    header.extend_from_slice(&(eph_der.len() as u16).to_be_bytes());
    header.extend_from_slice(&iv);
    header.extend_from_slice(kid.as_bytes());
    header.extend_from_slice(&eph_der);

    let shared = eph_secret.diffie_hellman(server_public);
    let server_der = keys::encode_spki(server_public);
    let content_key =
        derive_content_key(shared.as_bytes(), &iv, kid.as_bytes(), &eph_der, &server_der);

    let key_bytes: &[u8; 32] = &content_key;
    let cipher = Aes256Gcm::new(key_bytes.into());
    let sealed = cipher
        .encrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: frame.as_slice(),
                aad: &header,
            },
        )
        .map_err(|_| TransportError::Integrity)?;
    let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

    let mut out = Vec::with_capacity(header.len() + TAG_LEN + ciphertext.len());
    out.extend_from_slice(&header);
    out.extend_from_slice(tag);
    out.extend_from_slice(ciphertext);
    Ok(out)
}
