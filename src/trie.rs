//! The trie itself (component D): insert, delete, lookup and iteration.
//!
//! Every recursive step takes a `Twig` *by value* and returns the `Twig`
//! that should replace it, rather than mutating through a `TwigRef`. The
//! caller commits the result into the slot (or field) that held the
//! original — the root field for the top-level call, an entry in a
//! branch's child array for everything beneath it. This makes
//! copy-on-write a property of how a result gets committed rather than a
//! separate code path threaded through the recursion, and it's what lets
//! `gc::copy_reachable` share the exact same shape of code as insert.

use std::hash::Hasher;
use std::sync::{Arc, OnceLock};

use siphasher::sip128::{Hasher128, SipHasher24};

use crate::alloc::{AllocConfig, Allocator};
use crate::bitset::Bitmap47;
use crate::error::{QpError, QpResult};
use crate::key::{self, KeyBuf, TERMINATOR};
use crate::memusage::MemUsage;
use crate::node::{representative_ref, twig_hash, twig_leaf_count, Branch, Leaf, Twig, TwigRef};
use crate::vtable::{LeafMethods, LeafValue};

fn hash_keys() -> (u64, u64) {
    static KEYS: OnceLock<(u64, u64)> = OnceLock::new();
    *KEYS.get_or_init(|| {
        use rand::RngCore;
        let mut rng = rand::thread_rng();
        (rng.next_u64(), rng.next_u64())
    })
}

/// Structural hash of a key, folded (XOR) up every ancestor branch.
/// Independent of the two random per-process keys, so hashes are not
/// stable across runs or usable as a persistent identifier.
pub(crate) fn hash_key(key: &[u8]) -> u128 {
    let (k0, k1) = hash_keys();
    let mut hasher = SipHasher24::new_with_keys(k0, k1);
    hasher.write(key);
    hasher.finish128().as_u128()
}

/// The index of the first symbol at which `a` and `b` differ. Callers only
/// ever invoke this on two distinct well-formed keys, for which such an
/// index always exists: symbol 0 appears only as a key's final byte, so
/// neither can be a strict prefix of the other.
fn first_divergence(a: &[u8], b: &[u8]) -> usize {
    let n = a.len().min(b.len());
    for i in 0..n {
        if a[i] != b[i] {
            return i;
        }
    }
    n
}

fn symbol_at(key: &[u8], index: usize) -> u8 {
    key.get(index).copied().unwrap_or(TERMINATOR)
}

/// A qp-trie over byte-string keys, keyed indirectly through a
/// [`LeafMethods`] vtable rather than storing keys itself.
///
/// `methods` is held behind an `Arc` rather than owned directly so that
/// `multi::QpMulti` can clone a whole `Qp` into a private working copy for
/// each write transaction (a deep copy of `alloc`, an `Arc::clone` of
/// `methods`) without requiring `M: Clone`.
pub struct Qp<M: LeafMethods> {
    pub(crate) root: Twig,
    pub(crate) alloc: Allocator,
    methods: Arc<M>,
    leaf_count: u64,
}

impl<M: LeafMethods> Qp<M> {
    pub fn new(methods: M) -> Self {
        Self::with_config(methods, AllocConfig::default())
    }

    pub fn with_config(methods: M, config: AllocConfig) -> Self {
        Qp {
            root: Twig::Empty,
            alloc: Allocator::new(config),
            methods: Arc::new(methods),
            leaf_count: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.leaf_count
    }

    pub fn is_empty(&self) -> bool {
        self.leaf_count == 0
    }

    pub fn methods(&self) -> &M {
        self.methods.as_ref()
    }

    /// A cheap handle to the same `methods` this trie uses, shared (not
    /// duplicated) with every clone made from this trie. Used by
    /// `multi::QpMulti` to call `detach` on a retired leaf without holding
    /// on to a whole `Qp`.
    pub(crate) fn methods_arc(&self) -> Arc<M> {
        Arc::clone(&self.methods)
    }

    /// Computes the hash/leaf_count/childleaf aggregates for a branch's
    /// `count` children starting at `children`.
    fn fold(&self, count: u32, children: TwigRef) -> (u128, u64, TwigRef) {
        let mut hash = 0u128;
        let mut leaf_count = 0u64;
        let mut childleaf = TwigRef::NULL;
        for i in 0..count {
            let r = children.offset(i);
            let t = self.alloc.get(r);
            hash ^= twig_hash(&t);
            leaf_count += twig_leaf_count(&t);
            if childleaf.is_null() {
                childleaf = representative_ref(&t, r);
            }
        }
        (hash, leaf_count, childleaf)
    }

    /// Writes `new_child` into `b`'s child array at offset `off`, copying
    /// the array first if it is shared, and returns `b` with its
    /// aggregates refreshed.
    fn update_child_in_array(&mut self, b: Branch, off: u32, new_child: Twig) -> Branch {
        let count = b.bitmap.count();
        let children = if self.alloc.is_mutable(b.children) {
            self.alloc.set(b.children.offset(off), new_child);
            b.children
        } else {
            let fresh = self.alloc.alloc_run(count, Twig::Empty);
            for i in 0..count {
                let t = if i == off {
                    new_child
                } else {
                    self.alloc.get(b.children.offset(i))
                };
                self.alloc.set(fresh.offset(i), t);
            }
            fresh
        };
        let (hash, leaf_count, childleaf) = self.fold(count, children);
        Branch {
            children,
            hash,
            leaf_count,
            childleaf,
            ..b
        }
    }

    fn insert_new_child(&mut self, b: Branch, sym: u8, value: LeafValue, leaf_hash: u128) -> Twig {
        let off = b.bitmap.rank(sym) as u32;
        let old_count = b.bitmap.count();
        let new_count = old_count + 1;
        let new_children = self.alloc.alloc_run(new_count, Twig::Empty);
        for i in 0..off {
            let t = self.alloc.get(b.children.offset(i));
            self.alloc.set(new_children.offset(i), t);
        }
        self.alloc.set(
            new_children.offset(off),
            Twig::Leaf(Leaf {
                value,
                hash: leaf_hash,
            }),
        );
        for i in off..old_count {
            let t = self.alloc.get(b.children.offset(i));
            self.alloc.set(new_children.offset(i + 1), t);
        }
        if old_count > 0 {
            self.alloc.reclaim(b.children, old_count);
        }
        let mut bitmap = b.bitmap;
        bitmap.set(sym);
        let (hash, leaf_count, childleaf) = self.fold(new_count, new_children);
        Twig::Branch(Branch {
            index: b.index,
            bitmap,
            children: new_children,
            childleaf,
            leaf_count,
            hash,
        })
    }

    fn remove_child(&mut self, b: Branch, off: u32, sym: u8) -> Twig {
        let old_count = b.bitmap.count();
        let new_count = old_count - 1;
        let new_children = self.alloc.alloc_run(new_count, Twig::Empty);
        for i in 0..off {
            let t = self.alloc.get(b.children.offset(i));
            self.alloc.set(new_children.offset(i), t);
        }
        for i in (off + 1)..old_count {
            let t = self.alloc.get(b.children.offset(i));
            self.alloc.set(new_children.offset(i - 1), t);
        }
        self.alloc.reclaim(b.children, old_count);
        let mut bitmap = b.bitmap;
        bitmap.unset(sym);
        let (hash, leaf_count, childleaf) = self.fold(new_count, new_children);
        Twig::Branch(Branch {
            index: b.index,
            bitmap,
            children: new_children,
            childleaf,
            leaf_count,
            hash,
        })
    }

    fn build_branch(
        &mut self,
        index: usize,
        key: &[u8],
        value: LeafValue,
        new_hash: u128,
        old_key: &[u8],
        old_twig: Twig,
    ) -> Twig {
        let sym_new = symbol_at(key, index);
        let sym_old = symbol_at(old_key, index);
        debug_assert_ne!(sym_new, sym_old);
        let mut bitmap = Bitmap47::new_empty();
        bitmap.set(sym_new);
        bitmap.set(sym_old);
        let new_leaf = Twig::Leaf(Leaf {
            value,
            hash: new_hash,
        });
        let children = self.alloc.alloc_run(2, Twig::Empty);
        if sym_new < sym_old {
            self.alloc.set(children, new_leaf);
            self.alloc.set(children.offset(1), old_twig);
        } else {
            self.alloc.set(children, old_twig);
            self.alloc.set(children.offset(1), new_leaf);
        }
        let (hash, leaf_count, childleaf) = self.fold(2, children);
        Twig::Branch(Branch {
            index: index as u16,
            bitmap,
            children,
            childleaf,
            leaf_count,
            hash,
        })
    }

    fn insert_rec(
        &mut self,
        twig: Twig,
        key: &[u8],
        value: LeafValue,
        new_hash: u128,
    ) -> QpResult<Twig> {
        match twig {
            Twig::Empty => Ok(Twig::Leaf(Leaf {
                value,
                hash: new_hash,
            })),
            Twig::Leaf(leaf) => {
                let old_key = self.methods.makekey(leaf.value);
                if old_key.as_slice() == key {
                    return Err(QpError::Exists);
                }
                let d = first_divergence(key, &old_key);
                Ok(self.build_branch(d, key, value, new_hash, &old_key, Twig::Leaf(leaf)))
            }
            Twig::Branch(b) => {
                let rep = self.alloc.get(b.childleaf);
                let rep_leaf = match rep {
                    Twig::Leaf(l) => l,
                    _ => unreachable!("childleaf must reference a leaf"),
                };
                let rep_key = self.methods.makekey(rep_leaf.value);
                if rep_key.as_slice() == key {
                    return Err(QpError::Exists);
                }
                let d = first_divergence(key, &rep_key);
                if d < b.index as usize {
                    Ok(self.build_branch(d, key, value, new_hash, &rep_key, Twig::Branch(b)))
                } else {
                    let sym = symbol_at(key, b.index as usize);
                    if b.bitmap.is_set(sym) {
                        let off = b.bitmap.rank(sym) as u32;
                        let child = self.alloc.get(b.children.offset(off));
                        let new_child = self.insert_rec(child, key, value, new_hash)?;
                        let new_b = self.update_child_in_array(b, off, new_child);
                        Ok(Twig::Branch(new_b))
                    } else {
                        Ok(self.insert_new_child(b, sym, value, new_hash))
                    }
                }
            }
        }
    }

    /// Inserts `value` under `key`. `spec.md` §7: fails with
    /// [`QpError::Exists`] without modifying anything if `key` is already
    /// present.
    pub fn insert(&mut self, key: &[u8], value: LeafValue) -> QpResult<()> {
        debug_assert!(key::is_well_formed(key));
        let new_hash = hash_key(key);
        let new_root = self.insert_rec(self.root, key, value, new_hash)?;
        self.methods.attach(value);
        self.root = new_root;
        self.leaf_count += 1;
        Ok(())
    }

    fn delete_rec(&mut self, twig: Twig, key: &[u8]) -> QpResult<(Twig, LeafValue)> {
        match twig {
            Twig::Empty => Err(QpError::NotFound),
            Twig::Leaf(leaf) => {
                if self.methods.makekey(leaf.value).as_slice() == key {
                    Ok((Twig::Empty, leaf.value))
                } else {
                    Err(QpError::NotFound)
                }
            }
            Twig::Branch(b) => {
                let sym = symbol_at(key, b.index as usize);
                if !b.bitmap.is_set(sym) {
                    return Err(QpError::NotFound);
                }
                let off = b.bitmap.rank(sym) as u32;
                let child = self.alloc.get(b.children.offset(off));
                let (new_child, removed) = self.delete_rec(child, key)?;
                let count = b.bitmap.count();
                if matches!(new_child, Twig::Empty) {
                    if count == 2 {
                        let other_off = if off == 0 { 1 } else { 0 };
                        let survivor = self.alloc.get(b.children.offset(other_off));
                        self.alloc.reclaim(b.children, count);
                        Ok((survivor, removed))
                    } else {
                        Ok((self.remove_child(b, off, sym), removed))
                    }
                } else {
                    let new_b = self.update_child_in_array(b, off, new_child);
                    Ok((Twig::Branch(new_b), removed))
                }
            }
        }
    }

    /// Deletes `key`. `spec.md` §7: fails with [`QpError::NotFound`] if
    /// `key` is absent.
    pub fn delete(&mut self, key: &[u8]) -> QpResult<()> {
        let value = self.delete_no_detach(key)?;
        self.methods.detach(value);
        Ok(())
    }

    /// Removes `key` without calling [`LeafMethods::detach`], returning
    /// the removed value so the caller can defer the detach call (used by
    /// `multi::QpMulti`, whose detach must wait for every pinned snapshot
    /// that might still see the old value to retire).
    pub(crate) fn delete_no_detach(&mut self, key: &[u8]) -> QpResult<LeafValue> {
        debug_assert!(key::is_well_formed(key));
        let (new_root, value) = self.delete_rec(self.root, key)?;
        self.root = new_root;
        self.leaf_count -= 1;
        Ok(value)
    }

    fn get_from(&self, twig: Twig, key: &[u8]) -> Option<LeafValue> {
        match twig {
            Twig::Empty => None,
            Twig::Leaf(leaf) => {
                if self.methods.makekey(leaf.value).as_slice() == key {
                    Some(leaf.value)
                } else {
                    None
                }
            }
            Twig::Branch(b) => {
                let sym = symbol_at(key, b.index as usize);
                if !b.bitmap.is_set(sym) {
                    return None;
                }
                let off = b.bitmap.rank(sym) as u32;
                self.get_from(self.alloc.get(b.children.offset(off)), key)
            }
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<LeafValue> {
        debug_assert!(key::is_well_formed(key));
        self.get_from(self.root, key)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    pub fn memusage(&self) -> MemUsage {
        self.alloc.memusage(self.leaf_count)
    }

    pub fn iter(&self) -> Iter<'_, M> {
        Iter::new(self)
    }
}

impl<M: LeafMethods> Clone for Qp<M> {
    /// Deep-clones `alloc` (every chunk's backing `Vec<Twig>`) and shares
    /// `methods` via `Arc::clone`. `multi::QpMulti` calls this once per
    /// write transaction to build a private working copy that can be
    /// mutated with no lock held against any reader; the copy is
    /// published (or discarded, on rollback) without ever touching the
    /// trie it was cloned from.
    fn clone(&self) -> Self {
        Qp {
            root: self.root,
            alloc: self.alloc.clone(),
            methods: Arc::clone(&self.methods),
            leaf_count: self.leaf_count,
        }
    }
}

impl<M: LeafMethods> std::fmt::Debug for Qp<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Qp").field("leaf_count", &self.leaf_count).finish()
    }
}

/// Depth-first, symbol-ascending iteration. Since every child array is
/// already packed in ascending symbol order (`bitset::Bitmap47::rank`),
/// walking it left to right yields keys in lexicographic order.
pub struct Iter<'a, M: LeafMethods> {
    qp: &'a Qp<M>,
    stack: Vec<(Twig, u32)>,
}

impl<'a, M: LeafMethods> Iter<'a, M> {
    fn new(qp: &'a Qp<M>) -> Self {
        Self::from_root(qp, qp.root)
    }

    fn from_root(qp: &'a Qp<M>, root: Twig) -> Self {
        let mut stack = Vec::new();
        if !matches!(root, Twig::Empty) {
            stack.push((root, 0));
        }
        Iter { qp, stack }
    }
}

impl<'a, M: LeafMethods> Iterator for Iter<'a, M> {
    type Item = (KeyBuf, LeafValue);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (twig, offset) = self.stack.pop()?;
            match twig {
                Twig::Empty => {}
                Twig::Leaf(leaf) => {
                    return Some((self.qp.methods.makekey(leaf.value), leaf.value));
                }
                Twig::Branch(b) => {
                    let count = b.bitmap.count();
                    if offset < count {
                        self.stack.push((Twig::Branch(b), offset + 1));
                        let child = self.qp.alloc.get(b.children.offset(offset));
                        self.stack.push((child, 0));
                    }
                }
            }
        }
    }
}

impl<'a, M: LeafMethods> IntoIterator for &'a Qp<M> {
    type Item = (KeyBuf, LeafValue);
    type IntoIter = Iter<'a, M>;

    fn into_iter(self) -> Iter<'a, M> {
        self.iter()
    }
}
