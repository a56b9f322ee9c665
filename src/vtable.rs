//! The leaf callback vtable (component G).
//!
//! The trie never stores a leaf's key and never owns the external resource a
//! leaf's `pval` points at; both are recovered or adjusted through these
//! four callbacks, supplied by whoever embeds the trie. Per `spec.md` §4.7
//! none of them may fail or block, and all of them run only while the
//! caller already holds the writer lock (or, for a bare `trie::Qp`, on the
//! caller's own stack).

use crate::key::KeyBuf;

/// An opaque (pointer, uint32) leaf payload. `spec.md` §3 requires the
/// pointer's bottom two bits to be zero; the trie never dereferences
/// `pval` itself, only round-trips it through `LeafMethods`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeafValue {
    pub pval: usize,
    pub ival: u32,
}

impl LeafValue {
    pub fn new(pval: usize, ival: u32) -> Self {
        debug_assert_eq!(pval & 0b11, 0, "pval low bits must be zero");
        LeafValue { pval, ival }
    }
}

pub trait LeafMethods {
    /// Increments the user's refcount on `value`. Called once on insert,
    /// and would be called again on copy-on-write duplication if a leaf's
    /// external resource needed its own refcount per physical copy — this
    /// crate's leaves are plain `Copy` data, so duplication during a CoW
    /// array copy never calls `attach` a second time for the same logical
    /// insert (see DESIGN.md).
    fn attach(&self, value: LeafValue);

    /// Decrements the user's refcount on `value`: once when the leaf
    /// leaves the live trie, and not again until it is no longer visible
    /// to any pinned reader (see `multi::QpMulti`).
    fn detach(&self, value: LeafValue);

    /// Rederives `value`'s key. Pure, deterministic, and (per `spec.md`
    /// §9) expected to run in roughly constant time with no allocation on
    /// the steady-state path.
    fn makekey(&self, value: LeafValue) -> KeyBuf;

    /// Writes a human-readable label for `value` into `buf`, truncating to
    /// `buf.len()` if necessary (mirrors BIND9's `dns_qp_triename(..., size)`
    /// contract), and returns the number of bytes written.
    fn triename(&self, value: LeafValue, buf: &mut [u8]) -> usize;
}
