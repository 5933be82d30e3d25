//! Byte-level conversion between host strings and the UTF-16BE used on
//! the wire for names and path components, plus the legacy charsets the
//! devices use for display names.

use encoding_rs::Encoding;

/// Encode to NUL-terminated UTF-16BE, the wire form of NAME headers.
pub fn to_utf16be(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity((s.len() + 1) * 2);
    for unit in s.encode_utf16() {
        out.extend_from_slice(&unit.to_be_bytes());
    }
    out.extend_from_slice(&[0, 0]);
    out
}

/// Decode UTF-16BE bytes; a trailing NUL terminator is dropped.
/// Returns `None` for odd lengths or unpaired surrogates.
pub fn from_utf16be(bytes: &[u8]) -> Option<String> {
    if bytes.len() % 2 != 0 {
        return None;
    }
    let mut units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    while units.last() == Some(&0) {
        units.pop();
    }
    String::from_utf16(&units).ok()
}

/// Decode device-side bytes in the named charset, lossily.  Unknown
/// labels fall back to a lossy UTF-8 read.
pub fn decode_charset(label: &str, bytes: &[u8]) -> String {
    match Encoding::for_label(label.as_bytes()) {
        Some(enc) => enc.decode(bytes).0.into_owned(),
        None => String::from_utf8_lossy(bytes).into_owned(),
    }
}
