//! UCS-2 string encoding for iTunesDB property blocks
//!
//! String `mhod` payloads are stored as little-endian 16-bit code units with
//! no terminator. The byte length is stored in the block header, the character
//! count is implied (`byte_len / 2`).
//!
//! Characters outside the Basic Multilingual Plane are written as surrogate
//! pairs, which is what iTunes itself emits.

/// Encode a string as UCS-2 little-endian bytes
pub fn encode_ucs2(s: &str) -> Vec<u8> {
    let mut result = Vec::with_capacity(encoded_length(s));
    for unit in s.encode_utf16() {
        result.extend_from_slice(&unit.to_le_bytes());
    }
    result
}

/// Decode UCS-2 little-endian bytes
///
/// A trailing odd byte is ignored and unpaired surrogates are replaced, so a
/// damaged payload never aborts a parse.
pub fn decode_ucs2(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

/// Number of code units a string occupies once encoded
pub fn char_length(s: &str) -> usize {
    s.encode_utf16().count()
}

/// Get the encoded length of a string without actually encoding it
pub fn encoded_length(s: &str) -> usize {
    char_length(s) * 2
}
