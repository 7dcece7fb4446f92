//! UTF-16LE string transport.

use crate::WireError;

/// Encode a string as UTF-16LE bytes.
#[must_use]
pub fn encode_utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

/// Decode UTF-16LE bytes; odd lengths and invalid sequences are malformed
/// input, not data to be repaired.
pub fn decode_utf16le(bytes: &[u8]) -> Result<String, WireError> {
    if bytes.len() % 2 != 0 {
        return Err(WireError::InvalidArgument(format!(
            "utf-16 field has odd byte length {}",
            bytes.len()
        )));
    }
    let units: Vec<u16> =
        bytes.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
    String::from_utf16(&units)
        .map_err(|_| WireError::InvalidArgument("utf-16 field has unpaired surrogate".into()))
}
