//! The error taxonomy from `spec.md` §7.
//!
//! Only two outcomes are ever surfaced to a caller as a `Result`: a lookup
//! or delete of an absent key, and an insert of a key that already exists.
//! Everything else `spec.md` calls a *programmer error* — a broken
//! invariant, a handle used across threads, a commit of the wrong handle —
//! and those abort via `panic!`/`debug_assert!` rather than being encoded
//! here, matching `patch/branch.rs`'s `debug_check_invariants` convention in
//! the pack this crate is built from.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpError {
    NotFound,
    Exists,
}

impl fmt::Display for QpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QpError::NotFound => write!(f, "key not found"),
            QpError::Exists => write!(f, "key already exists"),
        }
    }
}

impl std::error::Error for QpError {}

pub type QpResult<T> = Result<T, QpError>;
