#![doc = include_str!("../README.md")]

pub mod alloc;
pub mod bitset;
pub mod epoch;
pub mod error;
pub mod gc;
pub mod key;
pub mod memusage;
pub mod multi;
pub mod node;
pub mod trie;
pub mod vtable;

pub use error::{QpError, QpResult};
pub use multi::{QpMulti, ReadView, Snapshot, Transaction, TxnKind};
pub use trie::Qp;
pub use vtable::{LeafMethods, LeafValue};
