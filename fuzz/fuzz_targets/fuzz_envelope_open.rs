#![no_main]

use std::sync::LazyLock;

use libfuzzer_sys::fuzz_target;
use zeroize::Zeroizing;

use drawbridge::transport::keys::TransportKey;
use drawbridge::transport::{CryptoMode, EnvelopeOpener};

// Deterministic keys keep fuzz crash reproduction stable across restarts.
static OPENER: LazyLock<EnvelopeOpener> = LazyLock::new(|| {
    let transport_key = TransportKey::from_scalar("fuzz-kid", [0x5a; 32]);
    EnvelopeOpener::new(
        CryptoMode::Compat,
        Some(Zeroizing::new([0xa5; 32])),
        Some(std::sync::Arc::new(transport_key)),
    )
});

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes must never panic the envelope parser; almost all
    // inputs fail the AEAD, which is fine.
    let _ = OPENER.open(data);
});
