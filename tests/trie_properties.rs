//! The seven testable properties from `spec.md` §8, as `proptest`
//! properties over randomly generated key sets.

use proptest::prelude::*;
use qpt::epoch::ManualEpoch;
use qpt::key::{self, KeyBuf};
use qpt::{LeafMethods, LeafValue, Qp, QpMulti};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

#[derive(Default)]
struct VecMethods {
    keys: RefCell<Vec<KeyBuf>>,
    refcounts: RefCell<HashMap<u32, i32>>,
}

impl VecMethods {
    fn leaf(&self, key: KeyBuf) -> (LeafValue, KeyBuf) {
        let mut keys = self.keys.borrow_mut();
        let ival = keys.len() as u32;
        keys.push(key.clone());
        (LeafValue::new(0, ival), key)
    }

    fn refcount(&self, value: LeafValue) -> i32 {
        *self.refcounts.borrow().get(&value.ival).unwrap_or(&0)
    }
}

impl LeafMethods for VecMethods {
    fn attach(&self, value: LeafValue) {
        *self.refcounts.borrow_mut().entry(value.ival).or_insert(0) += 1;
    }
    fn detach(&self, value: LeafValue) {
        *self.refcounts.borrow_mut().entry(value.ival).or_insert(0) -= 1;
    }
    fn makekey(&self, value: LeafValue) -> KeyBuf {
        self.keys.borrow()[value.ival as usize].clone()
    }
    fn triename(&self, _value: LeafValue, _buf: &mut [u8]) -> usize {
        0
    }
}

fn label_key(label: &str) -> KeyBuf {
    key::encode_dns_name(&[label.as_bytes()])
}

/// A set of short, distinct labels, small enough that whole-set proptest
/// runs stay fast while still exercising splits, merges and multi-level
/// branches.
fn distinct_labels() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[a-z0-9]{1,5}", 0..40).prop_map(|labels| {
        let mut seen = HashSet::new();
        labels.into_iter().filter(|l| seen.insert(l.clone())).collect()
    })
}

proptest! {
    /// Property 1: inserting any distinct key set, in any order, yields an
    /// iteration in ascending byte-lex order over exactly that set.
    #[test]
    fn round_trip_sorted(labels in distinct_labels()) {
        let methods = VecMethods::default();
        let mut trie = Qp::new(methods);
        let mut inserted = Vec::new();
        for label in &labels {
            let (value, key) = trie.methods().leaf(label_key(label));
            trie.insert(&key, value).unwrap();
            inserted.push(key);
        }

        let mut expected = inserted.clone();
        expected.sort();
        let iterated: Vec<KeyBuf> = trie.iter().map(|(k, _)| k).collect();
        prop_assert_eq!(iterated, expected);
        prop_assert_eq!(trie.len(), inserted.len() as u64);
    }

    /// Property 2: inserting S then deleting a subset D leaves exactly
    /// S \ D reachable.
    #[test]
    fn insert_delete_is_set_difference(
        labels in distinct_labels(),
        delete_mask in prop::collection::vec(any::<bool>(), 0..40),
    ) {
        let methods = VecMethods::default();
        let mut trie = Qp::new(methods);
        let mut keys = Vec::new();
        for label in &labels {
            let (value, key) = trie.methods().leaf(label_key(label));
            trie.insert(&key, value).unwrap();
            keys.push(key);
        }

        let mut survivors = Vec::new();
        for (i, key) in keys.iter().enumerate() {
            if delete_mask.get(i).copied().unwrap_or(false) {
                trie.delete(key).unwrap();
            } else {
                survivors.push(key.clone());
            }
        }

        for key in &survivors {
            prop_assert!(trie.contains(key));
        }
        for (i, key) in keys.iter().enumerate() {
            if delete_mask.get(i).copied().unwrap_or(false) {
                prop_assert!(!trie.contains(key));
            }
        }
        prop_assert_eq!(trie.len(), survivors.len() as u64);
    }

    /// Property 3: two tries built from permutations of the same key
    /// multiset have equal iteration order and equal `memusage().leaves`.
    #[test]
    fn insertion_order_does_not_affect_contents(
        labels in distinct_labels(),
        seed in any::<u64>(),
    ) {
        let methods_a = VecMethods::default();
        let mut trie_a = Qp::new(methods_a);
        for label in &labels {
            let (value, key) = trie_a.methods().leaf(label_key(label));
            trie_a.insert(&key, value).unwrap();
        }

        let mut shuffled = labels.clone();
        // A cheap deterministic shuffle driven by the proptest-supplied
        // seed, avoiding a dependency on `rand`'s shuffle for this test.
        let n = shuffled.len();
        for i in (1..n).rev() {
            let j = (seed.wrapping_add(i as u64) as usize) % (i + 1);
            shuffled.swap(i, j);
        }

        let methods_b = VecMethods::default();
        let mut trie_b = Qp::new(methods_b);
        for label in &shuffled {
            let (value, key) = trie_b.methods().leaf(label_key(label));
            trie_b.insert(&key, value).unwrap();
        }

        let iter_a: Vec<KeyBuf> = trie_a.iter().map(|(k, _)| k).collect();
        let iter_b: Vec<KeyBuf> = trie_b.iter().map(|(k, _)| k).collect();
        prop_assert_eq!(iter_a, iter_b);
        prop_assert_eq!(trie_a.memusage().leaves, trie_b.memusage().leaves);
    }

    /// Property 4: a snapshot's lookups reflect only commits made before it
    /// was pinned, for an arbitrary interleaving of writes and snapshots.
    #[test]
    fn snapshot_sees_only_its_own_generation(
        labels in distinct_labels(),
        snapshot_after in prop::collection::vec(any::<bool>(), 0..40),
    ) {
        let methods = VecMethods::default();
        let multi = QpMulti::new(methods, Box::new(ManualEpoch::new(1)));

        let mut committed = Vec::new();
        let mut snapshots = Vec::new();
        for (i, label) in labels.iter().enumerate() {
            let key = label_key(label);
            {
                let mut txn = multi.write();
                let (value, key) = txn.methods().leaf(key.clone());
                txn.insert(&key, value).unwrap();
                txn.commit();
            }
            committed.push(key);
            if snapshot_after.get(i).copied().unwrap_or(false) {
                snapshots.push((multi.snapshot(), committed.clone()));
            }
        }

        for (snapshot, visible_at_pin_time) in &snapshots {
            for key in visible_at_pin_time {
                prop_assert!(snapshot.get(key).is_some());
            }
            let visible: HashSet<&KeyBuf> = visible_at_pin_time.iter().collect();
            for key in &committed {
                if !visible.contains(key) {
                    prop_assert!(snapshot.get(key).is_none());
                }
            }
        }
    }

    /// Property 5: `attach`/`detach` balance exactly once every inserted
    /// key has been deleted again and no snapshot is pinned.
    #[test]
    fn attach_detach_balance_with_no_pinned_snapshots(labels in distinct_labels()) {
        let methods = VecMethods::default();
        let mut trie = Qp::new(methods);
        let mut values = Vec::new();
        for label in &labels {
            let (value, key) = trie.methods().leaf(label_key(label));
            trie.insert(&key, value).unwrap();
            values.push((value, key));
        }
        for (_, key) in &values {
            trie.delete(key).unwrap();
        }
        for (value, _) in &values {
            prop_assert_eq!(trie.methods().refcount(*value), 0);
        }
    }

    /// Property 6: after a forced full compaction, the fresh allocator has
    /// no dead slots at all: `live == used` and `hold + free == 0`.
    #[test]
    fn compaction_leaves_no_dead_slots(
        labels in distinct_labels(),
        delete_mask in prop::collection::vec(any::<bool>(), 0..40),
    ) {
        let methods = VecMethods::default();
        let mut trie = Qp::new(methods);
        let mut keys = Vec::new();
        for label in &labels {
            let (value, key) = trie.methods().leaf(label_key(label));
            trie.insert(&key, value).unwrap();
            keys.push(key);
        }
        for (i, key) in keys.iter().enumerate() {
            if delete_mask.get(i).copied().unwrap_or(false) {
                trie.delete(key).unwrap();
            }
        }

        trie.compact(true);

        let usage = trie.memusage();
        prop_assert_eq!(usage.live, usage.used);
        prop_assert_eq!(usage.hold + usage.free, 0);
    }

    /// Property 7: iteration order matches byte-lex key order for every
    /// pair of keys in the trie, and that order agrees with the real
    /// label bytes the keys were derived from (not just with each other —
    /// a codec that scrambles byte order but does so consistently would
    /// still pass a self-comparison-only check).
    #[test]
    fn iteration_matches_byte_lex_order(labels in distinct_labels()) {
        let methods = VecMethods::default();
        let mut trie = Qp::new(methods);
        for label in &labels {
            let (value, key) = trie.methods().leaf(label_key(label));
            trie.insert(&key, value).unwrap();
        }

        let iterated: Vec<(KeyBuf, String)> = trie
            .iter()
            .map(|(k, v)| (k, labels[v.ival as usize].clone()))
            .collect();
        for pair in iterated.windows(2) {
            prop_assert!(pair[0].0.as_slice() < pair[1].0.as_slice());
            prop_assert!(pair[0].1.as_bytes() < pair[1].1.as_bytes());
        }
    }
}
