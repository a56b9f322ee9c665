//! Compaction (component E): rebuilding a trie into a fresh allocator to
//! reclaim dead slots.
//!
//! `copy_reachable` walks the live twig tree and re-homes every twig into a
//! new [`Allocator`], in the same value-in/value-out shape as
//! `trie::Qp`'s insert and delete recursions. `spec.md` §5 distinguishes a
//! forced full rebuild (`compact(true)`) from an opportunistic one
//! (`compact(false)`); this crate treats the latter as a no-op unless the
//! allocator itself reports fragmentation, rather than selectively
//! splicing individual chunks (see DESIGN.md).

use crate::alloc::Allocator;
use crate::node::Twig;
use crate::trie::Qp;
use crate::vtable::LeafMethods;

impl<M: LeafMethods> Qp<M> {
    /// Rebuilds the trie into a fresh allocator, discarding every dead
    /// slot. With `all = false`, only rebuilds if the current allocator is
    /// fragmented past its configured threshold; `all = true` always
    /// rebuilds.
    pub fn compact(&mut self, all: bool) {
        if !all && !self.alloc.fragmented() {
            return;
        }
        let mut fresh = Allocator::new(self.alloc.config());
        let new_root = self.copy_reachable(&mut fresh, self.root);
        self.alloc = fresh;
        self.root = new_root;
    }

    fn copy_reachable(&self, dest: &mut Allocator, twig: Twig) -> Twig {
        match twig {
            Twig::Empty => Twig::Empty,
            Twig::Leaf(leaf) => Twig::Leaf(leaf),
            Twig::Branch(b) => {
                let count = b.bitmap.count();
                let new_children = dest.alloc_run(count, Twig::Empty);
                let mut childleaf = crate::node::TwigRef::NULL;
                for i in 0..count {
                    let child = self.alloc.get(b.children.offset(i));
                    let new_child = self.copy_reachable(dest, child);
                    let new_ref = new_children.offset(i);
                    dest.set(new_ref, new_child);
                    if childleaf.is_null() {
                        childleaf = crate::node::representative_ref(&new_child, new_ref);
                    }
                }
                Twig::Branch(crate::node::Branch {
                    index: b.index,
                    bitmap: b.bitmap,
                    children: new_children,
                    childleaf,
                    leaf_count: b.leaf_count,
                    hash: b.hash,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{self, KeyBuf};
    use crate::vtable::LeafValue;
    use std::cell::RefCell;

    #[derive(Default)]
    struct VecMethods {
        keys: RefCell<Vec<KeyBuf>>,
    }

    impl VecMethods {
        fn key_for(&self, labels: &[&[u8]]) -> (LeafValue, KeyBuf) {
            let key = key::encode_dns_name(labels);
            let mut keys = self.keys.borrow_mut();
            let ival = keys.len() as u32;
            keys.push(key.clone());
            (LeafValue::new(0, ival), key)
        }
    }

    impl LeafMethods for VecMethods {
        fn attach(&self, _value: LeafValue) {}
        fn detach(&self, _value: LeafValue) {}
        fn makekey(&self, value: LeafValue) -> KeyBuf {
            self.keys.borrow()[value.ival as usize].clone()
        }
        fn triename(&self, _value: LeafValue, _buf: &mut [u8]) -> usize {
            0
        }
    }

    #[test]
    fn compact_preserves_all_entries() {
        let methods = VecMethods::default();
        let mut trie = Qp::new(methods);
        let mut keys = Vec::new();
        for i in 0..40u32 {
            let label = i.to_string();
            let (value, key) = trie.methods().key_for(&[label.as_bytes(), b"example", b"com"]);
            trie.insert(&key, value).unwrap();
            keys.push(key);
        }
        for key in keys.iter().step_by(3) {
            trie.delete(key).unwrap();
        }
        let before: Vec<_> = trie.iter().collect();
        trie.compact(true);
        let after: Vec<_> = trie.iter().collect();
        assert_eq!(before, after);
        for (i, key) in keys.iter().enumerate() {
            if i % 3 == 0 {
                assert!(!trie.contains(key));
            } else {
                assert!(trie.contains(key));
            }
        }
    }

    #[test]
    fn compact_false_is_noop_when_not_fragmented() {
        let methods = VecMethods::default();
        let mut trie = Qp::new(methods);
        let (value, key) = trie.methods().key_for(&[b"example", b"com"]);
        trie.insert(&key, value).unwrap();
        trie.compact(false);
        assert!(trie.contains(&key));
    }
}
