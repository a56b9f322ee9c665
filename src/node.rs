//! Node representation (component B).
//!
//! `spec.md` §4.2 describes a twig as two machine words with a hand-packed
//! bit layout, but is explicit that "implementations may pack differently
//! as long as the externally observable behavior matches." This crate uses
//! a plain tagged enum instead of manual bit-packing, and replaces raw
//! pointers between twigs with `(chunk, slot)` references (`spec.md` §9,
//! "chunk-ref vs raw pointer") so that a reference can be copied without
//! walking the trie.

use crate::bitset::Bitmap47;
use crate::vtable::LeafValue;

/// A reference to a twig inside the allocator: the chunk it lives in and
/// its slot within that chunk. `TwigRef`s to the start of a branch's child
/// array are offsettable by symbol rank (see `Branch::children`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct TwigRef {
    pub chunk: u32,
    pub slot: u32,
}

impl TwigRef {
    pub const NULL: TwigRef = TwigRef {
        chunk: u32::MAX,
        slot: u32::MAX,
    };

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    pub fn offset(&self, delta: u32) -> TwigRef {
        TwigRef {
            chunk: self.chunk,
            slot: self.slot + delta,
        }
    }
}

/// A single node of the trie. Every twig but the root lives inside some
/// branch's child array; the root occupies its own one-twig allocation
/// (`trie::Qp::root`).
#[derive(Debug, Clone, Copy)]
pub enum Twig {
    /// Never stored in the allocator; only used as the fill value for
    /// freshly grown chunks.
    Empty,
    Leaf(Leaf),
    Branch(Branch),
}

#[derive(Debug, Clone, Copy)]
pub struct Leaf {
    pub value: LeafValue,
    /// Structural hash of this leaf's key (independent of `value`), folded
    /// into every ancestor branch's `hash`. Lets two tries be compared for
    /// equal key sets without storing or rederiving every key — the same
    /// idiom as `patch::Head`'s hash-based `PartialEq` in the pack this
    /// crate is built from.
    pub hash: u128,
}

/// An interior node. Holds the depth at which it discriminates, a bitmap
/// of which of the 47 symbols have a child, and a reference to the start
/// of a packed, symbol-rank-ordered array of `bitmap.count()` children.
#[derive(Debug, Clone, Copy)]
pub struct Branch {
    pub index: u16,
    pub bitmap: Bitmap47,
    pub children: TwigRef,
    /// A representative leaf beneath this branch, cached so that prefix
    /// checks don't need to walk down (teacher idiom: `Branch::childleaf`
    /// in `patch/branch.rs`).
    pub childleaf: TwigRef,
    pub leaf_count: u64,
    pub hash: u128,
}

/// `popcount(bitmap)`-based rank of `twig`'s representative leaf: its own
/// ref if it's a leaf, or its cached `childleaf` if it's a branch.
pub(crate) fn representative_ref(twig: &Twig, own_ref: TwigRef) -> TwigRef {
    match twig {
        Twig::Leaf(_) => own_ref,
        Twig::Branch(b) => b.childleaf,
        Twig::Empty => TwigRef::NULL,
    }
}

pub(crate) fn twig_hash(twig: &Twig) -> u128 {
    match twig {
        Twig::Leaf(l) => l.hash,
        Twig::Branch(b) => b.hash,
        Twig::Empty => 0,
    }
}

pub(crate) fn twig_leaf_count(twig: &Twig) -> u64 {
    match twig {
        Twig::Leaf(_) => 1,
        Twig::Branch(b) => b.leaf_count,
        Twig::Empty => 0,
    }
}
