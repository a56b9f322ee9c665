//! The key codec contract (component A).
//!
//! A key is a sequence of 1-511 bytes drawn from the 47-symbol alphabet,
//! followed by an implicit terminator (symbol 0). Producing that sequence
//! from a DNS name is the caller's responsibility in the real system (the
//! `vtable::LeafMethods::makekey` callback) — this module only fixes the
//! alphabet and ships one concrete encoder so the rest of the crate has
//! something real to test against.

use arrayvec::ArrayVec;

/// Maximum encoded key length, including the terminator.
pub const MAX_KEY_LEN: usize = 512;

/// Symbol 0: end-of-key terminator. Never appears except as the final
/// symbol of a key.
pub const TERMINATOR: u8 = 0;

/// Symbol 1: label separator, pushed after every label's content symbols.
/// Strictly smaller than every symbol a byte's own encoding can start
/// with, so a label that is a strict prefix of another (`"com"` vs.
/// `"example.com"`'s trailing label `"com"`, or `"a"` vs. `"ab"`) always
/// sorts first regardless of what follows — the same role `TERMINATOR`
/// plays at the end of the whole key.
pub const DOT_SYMBOL: u8 = 1;

/// Every raw byte is encoded as exactly two symbols, the high and low
/// nibble of its value, offset into `NIBBLE_BASE..NIBBLE_BASE + 16`. This
/// is a fixed-width base-16 positional encoding: comparing two bytes'
/// symbol pairs numerically gives the same answer as comparing the raw
/// bytes, for every byte value, with no special-cased "common byte"
/// shortcut to fall out of order. A single plain-alphabet symbol per
/// common byte was tried and dropped — any escape sentinel prefixing the
/// rare bytes sorts at one fixed position regardless of the escaped
/// byte's actual value, breaking order for whichever common bytes happen
/// to fall numerically near the escaped ones (digits are the example
/// that surfaces it immediately, but any byte only one side of the
/// escape marker's position is equally broken).
const NIBBLE_BASE: u8 = 2;

/// A key buffer: at most `MAX_KEY_LEN` alphabet symbols.
pub type KeyBuf = ArrayVec<u8, MAX_KEY_LEN>;

fn push_byte(key: &mut KeyBuf, byte: u8) {
    key.push(NIBBLE_BASE + (byte >> 4));
    key.push(NIBBLE_BASE + (byte & 0x0f));
}

/// Encodes a DNS name, given as its labels in wire order (most significant
/// label first, e.g. `[b"www", b"example", b"com"]` for `www.example.com`),
/// into a sort-preserving key: labels are emitted right-most first so that
/// lexicographic key order matches DNS canonical tree order, and ASCII
/// letters are lowercased before encoding.
///
/// Panics if the encoded length would exceed `MAX_KEY_LEN` — `makekey`
/// callbacks must reject or truncate oversized names before calling this.
/// A maximal wire-valid DNS name (255 octets) never gets close: four
/// 63-byte labels, the longest such name can have, encode to 505 symbols.
pub fn encode_dns_name(labels: &[&[u8]]) -> KeyBuf {
    let mut key = KeyBuf::new();
    for label in labels.iter().rev() {
        for &byte in label.iter() {
            push_byte(&mut key, byte.to_ascii_lowercase());
        }
        key.push(DOT_SYMBOL);
    }
    key.push(TERMINATOR);
    assert!(key.len() <= MAX_KEY_LEN, "encoded key exceeds MAX_KEY_LEN");
    key
}

/// Checks the structural invariant from `spec.md` §3: symbol 0 appears only
/// as the final byte of the key, every symbol is within the alphabet, and
/// the key is non-empty.
pub fn is_well_formed(key: &[u8]) -> bool {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return false;
    }
    let (last, rest) = key.split_last().unwrap();
    *last == TERMINATOR
        && rest.iter().all(|&b| b != TERMINATOR && (b as u32) < super::bitset::ALPHABET_LEN)
        && (*last as u32) < super::bitset::ALPHABET_LEN
}
