//! Host-side glue: data directory resolution, short-filename checks,
//! and the XOR helpers used by the content engine.

use std::env;
use std::path::PathBuf;

/// Per-user writable data directory for staged content and the
/// user-key store.  Honors `$XDG_DATA_HOME`, falling back to
/// `~/.local/share`.
pub fn default_data_dir() -> Option<PathBuf> {
    let base = env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .or_else(|| env::var_os("HOME").map(|home| PathBuf::from(home).join(".local/share")))?;
    Some(base.join("lexlink"))
}

/// DOS 8.3 short-filename check.  Content files must pass it to be
/// accepted by the device.
pub fn is_valid_sfn(name: &str) -> bool {
    fn valid_char(b: u8) -> bool {
        b.is_ascii_alphanumeric() || b"$%'-_@~!(){}^#&".contains(&b)
    }
    if name.is_empty() || name == "." || name == ".." {
        return false;
    }
    let (base, ext) = match name.split_once('.') {
        Some((base, ext)) => (base, Some(ext)),
        None => (name, None),
    };
    if base.is_empty() || base.len() > 8 || !base.bytes().all(valid_char) {
        return false;
    }
    match ext {
        None => true,
        Some(ext) => {
            !ext.is_empty() && ext.len() <= 3 && !ext.contains('.') && ext.bytes().all(valid_char)
        }
    }
}

/// XOR `data` in place against the repeating 16-byte stream.  Applying
/// the same stream twice restores the input.
pub fn crypt_data(data: &mut [u8], stream: &[u8; 16]) {
    for (i, b) in data.iter_mut().enumerate() {
        *b ^= stream[i % 16];
    }
}

/// Derive the 16-byte xor stream for a master key.  Deterministic over
/// the input; no other component depends on the mixing internals.
pub fn get_xor_key(master: &[u8; 16]) -> [u8; 16] {
    let mut stream = [0u8; 16];
    let mut acc = master.iter().fold(0x5au8, |acc, b| acc.rotate_left(1) ^ *b);
    for i in 0..16 {
        acc = acc.rotate_left(3).wrapping_add(master[i] ^ master[15 - i]);
        stream[i] = acc ^ master[i];
    }
    stream
}
