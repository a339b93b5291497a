/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Reversible encoding of arbitrary strings into filesystem-safe names.
//!
//! The alphabet is shared bit-for-bit by every DecSync implementation so
//! that peers agree on filenames. A leading `.` is rewritten to `%2E`,
//! which keeps dotfiles available for engine internals only.

fn is_safe(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~')
}

/// Encodes a name for use on disk. Every byte outside `[A-Za-z0-9-_.~]`
/// becomes `%HH` with uppercase hex.
pub fn encode(name: &str) -> String {
    let mut result = String::with_capacity(name.len());
    for byte in name.bytes() {
        if is_safe(byte) {
            result.push(byte as char);
        } else {
            result.push_str(&format!("%{:02X}", byte));
        }
    }
    if result.starts_with('.') {
        result.replace_range(..1, "%2E");
    }
    result
}

/// Decodes an on-disk name. Returns `None` for hidden names (leading `.`),
/// lowercase or malformed hex escapes, bytes outside the safe alphabet and
/// invalid UTF-8.
pub fn decode(name: &str) -> Option<String> {
    if name.starts_with('.') {
        return None;
    }
    let mut bytes = Vec::with_capacity(name.len());
    let mut iter = name.bytes();
    while let Some(byte) = iter.next() {
        if byte == b'%' {
            let high = hex_value(iter.next()?)?;
            let low = hex_value(iter.next()?)?;
            bytes.push(high * 16 + low);
        } else if is_safe(byte) {
            bytes.push(byte);
        } else {
            return None;
        }
    }
    String::from_utf8(bytes).ok()
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}
