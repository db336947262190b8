//! Utility functions for identifiers and hashing

use bech32::Bech32m;
use uuid7::uuid7;

// construct a unique id then encode using bech32, e.g. `doc_1...`
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Content digest of an already encoded record.
pub fn digest(bytes: &[u8]) -> String {
    sha256::digest(bytes)
}
