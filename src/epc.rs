//! Uppercase hex rendering of tag identifiers.

use crate::error::{Error, Result};

/// Character budget used for EPCs in the polling loop.
pub const EPC_HEX_CAPACITY: usize = 512;

/// Renders `bytes` as uppercase hex within a budget of `max_output_chars`,
/// one of which is reserved for a terminator.
///
/// When the budget cannot hold every byte the input is cut to the whole bytes
/// that fit; this is not an error.
pub fn encode(bytes: &[u8], max_output_chars: usize) -> String {
    let fit = max_output_chars.saturating_sub(1) / 2;
    let len = bytes.len().min(fit);
    hex::encode_upper(&bytes[..len])
}

pub fn encode_all(bytes: &[u8]) -> String {
    encode(bytes, bytes.len() * 2 + 1)
}

/// Strips whitespace and uppercases a user-supplied EPC or EPC prefix.
pub fn normalize_epc(text: &str) -> Result<String> {
    let epc: String = text
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if let Some(bad) = epc.chars().find(|c| !c.is_ascii_hexdigit()) {
        return Err(Error::Config(format!("'{}' is not a hex EPC (found '{}')", text, bad)));
    }
    Ok(epc)
}

/// Parses a hex EPC as typed by a user back into bytes.
pub fn decode(text: &str) -> Result<Vec<u8>> {
    hex::decode(&normalize_epc(text)?)
        .map_err(|e| Error::Config(format!("'{}' is not a hex EPC: {}", text, e)))
}
