//! Property-based invariant tests for `KeyedCollection`.
//!
//! Invariants verified against a plain ordered-map replay:
//!
//! 1. After every operation, the collection's key order and item state match
//!    the replay exactly.
//! 2. A listener running inside `items_changed` observes the post-operation
//!    state, never a partial one.
//! 3. Failed operations leave the collection byte-for-byte unchanged and
//!    emit nothing.
//! 4. Every about payload is matched by an identical changed payload, in
//!    order.

use std::cell::RefCell;
use std::rc::Rc;

use nnav_model::{ApproxEq, AttrNames, ItemSignals, KeyedCollection, KeyedItem, attr_names};
use proptest::prelude::*;

// ── Fixture ──

#[derive(Clone)]
struct Probe {
    shell: Rc<ProbeShell>,
}

struct ProbeShell {
    signals: ItemSignals<String>,
    state: RefCell<ProbeState>,
}

struct ProbeState {
    key: String,
    gain: f64,
}

impl Probe {
    fn new(key: &str) -> Self {
        Self {
            shell: Rc::new(ProbeShell {
                signals: ItemSignals::new(),
                state: RefCell::new(ProbeState {
                    key: key.to_string(),
                    gain: 0.0,
                }),
            }),
        }
    }

    fn gain(&self) -> f64 {
        self.shell.state.borrow().gain
    }

    fn set_gain(&self, gain: f64) {
        if self.gain().approx_eq(&gain) {
            return;
        }
        let key = self.key();
        self.shell.signals.change_around(&key, &["gain"], || {
            self.shell.state.borrow_mut().gain = gain;
        });
    }
}

impl KeyedItem for Probe {
    type Key = String;

    fn key(&self) -> String {
        self.shell.state.borrow().key.clone()
    }

    fn set_key(&self, key: String) {
        let from = self.key();
        if from == key {
            return;
        }
        self.shell.signals.rekey_around(&from, &key, || {
            self.shell.state.borrow_mut().key = key.clone();
        });
    }

    fn signals(&self) -> &ItemSignals<String> {
        &self.shell.signals
    }

    fn same_item(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.shell, &other.shell)
    }
}

// ── Strategies ──

const KEY_POOL: [&str; 5] = ["a", "b", "c", "d", "e"];

#[derive(Debug, Clone)]
enum Op {
    /// Add a fresh item under the n-th pool key.
    Add(usize),
    /// Delete the n-th resident key (modulo count).
    Delete(usize),
    /// Rename the n-th resident key to the m-th pool key.
    Rename(usize, usize),
    /// Set gain on the n-th resident item.
    SetGain(usize, i32),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0usize..KEY_POOL.len()).prop_map(Op::Add),
        2 => (0usize..8).prop_map(Op::Delete),
        2 => ((0usize..8), (0usize..KEY_POOL.len())).prop_map(|(n, m)| Op::Rename(n, m)),
        3 => ((0usize..8), (-5i32..=5)).prop_map(|(n, v)| Op::SetGain(n, v)),
    ]
}

/// Plain insertion-ordered replay of the same operations.
#[derive(Debug, Clone, PartialEq)]
struct Replay {
    entries: Vec<(String, f64)>,
}

impl Replay {
    fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|(k, _)| k.clone()).collect()
    }
}

// ═══ 1–3. Replay comparison over arbitrary op sequences ═══

proptest! {
    #[test]
    fn state_matches_plain_map_replay(ops in proptest::collection::vec(op_strategy(), 1..50)) {
        let collection: KeyedCollection<Probe> = KeyedCollection::new();
        let mut replay = Replay { entries: Vec::new() };

        // Keys seen by a listener at changed-time, for invariant 2.
        let observed: Rc<RefCell<Vec<Vec<String>>>> = Rc::new(RefCell::new(Vec::new()));
        let observed2 = Rc::clone(&observed);
        let reader = collection.clone();
        collection.signals().items_changed().connect(move |_| {
            observed2.borrow_mut().push(reader.keys());
        });

        for op in ops {
            let before_emissions = observed.borrow().len();
            match op {
                Op::Add(n) => {
                    let key = KEY_POOL[n];
                    let ok = collection.add(Probe::new(key)).is_ok();
                    let expected_ok = !replay.keys().contains(&key.to_string());
                    prop_assert_eq!(ok, expected_ok);
                    if expected_ok {
                        replay.entries.push((key.to_string(), 0.0));
                    }
                }
                Op::Delete(n) => {
                    if replay.entries.is_empty() {
                        continue;
                    }
                    let key = replay.entries[n % replay.entries.len()].0.clone();
                    collection.delete(&[key.clone()]).unwrap();
                    replay.entries.retain(|(k, _)| *k != key);
                }
                Op::Rename(n, m) => {
                    if replay.entries.is_empty() {
                        continue;
                    }
                    let at = n % replay.entries.len();
                    let from = replay.entries[at].0.clone();
                    let to = KEY_POOL[m].to_string();
                    let collides = from != to && replay.keys().contains(&to);
                    let result = collection.rename(&from, to.clone());
                    if collides {
                        prop_assert!(result.is_err());
                        // Invariant 3: failed rename changed nothing and
                        // emitted nothing.
                        prop_assert_eq!(observed.borrow().len(), before_emissions);
                    } else {
                        prop_assert!(result.is_ok());
                        replay.entries[at].0 = to;
                    }
                }
                Op::SetGain(n, v) => {
                    if replay.entries.is_empty() {
                        continue;
                    }
                    let at = n % replay.entries.len();
                    let key = replay.entries[at].0.clone();
                    let value = f64::from(v);
                    let differs = replay.entries[at].1 != value;
                    collection.get(&key).unwrap().set_gain(value);
                    if differs {
                        replay.entries[at].1 = value;
                    } else {
                        prop_assert_eq!(observed.borrow().len(), before_emissions);
                    }
                }
            }

            // Invariant 1: keys, order, and values all match the replay.
            prop_assert_eq!(collection.keys(), replay.keys());
            for (key, gain) in &replay.entries {
                let item = collection.get(key);
                prop_assert!(item.is_some());
                prop_assert_eq!(item.unwrap().gain(), *gain);
            }

            // Invariant 2: whatever fired during this op saw the post-state
            // as its final observation.
            if observed.borrow().len() > before_emissions {
                let last = observed.borrow().last().cloned();
                prop_assert_eq!(last, Some(replay.keys()));
            }
        }
    }
}

// ═══ 4. About/changed payloads pair up exactly ═══

proptest! {
    #[test]
    fn about_and_changed_payloads_pair_up(ops in proptest::collection::vec(op_strategy(), 1..40)) {
        let collection: KeyedCollection<Probe> = KeyedCollection::new();

        type Payload = (Vec<String>, AttrNames);
        let abouts: Rc<RefCell<Vec<Payload>>> = Rc::new(RefCell::new(Vec::new()));
        let changeds: Rc<RefCell<Vec<Payload>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&abouts);
        collection.signals().items_about_to_change().connect(move |ev: &Payload| {
            sink.borrow_mut().push(ev.clone());
        });
        let sink = Rc::clone(&changeds);
        collection.signals().items_changed().connect(move |ev: &Payload| {
            sink.borrow_mut().push(ev.clone());
        });

        for op in ops {
            match op {
                Op::Add(n) => {
                    let _ = collection.add(Probe::new(KEY_POOL[n]));
                }
                Op::Delete(n) => {
                    let keys = collection.keys();
                    if !keys.is_empty() {
                        collection.delete(&[keys[n % keys.len()].clone()]).unwrap();
                    }
                }
                Op::Rename(n, m) => {
                    let keys = collection.keys();
                    if !keys.is_empty() {
                        let _ = collection.rename(&keys[n % keys.len()], KEY_POOL[m].to_string());
                    }
                }
                Op::SetGain(n, v) => {
                    let keys = collection.keys();
                    if !keys.is_empty() {
                        collection.get(&keys[n % keys.len()]).unwrap().set_gain(f64::from(v));
                    }
                }
            }
        }

        prop_assert_eq!(&*abouts.borrow(), &*changeds.borrow());
    }
}

// ═══ Batch writes diff against current state ═══

proptest! {
    #[test]
    fn batch_write_notifies_exactly_the_differing_keys(
        current in proptest::collection::vec(-3i32..=3, 1..6),
        target in proptest::collection::vec(-3i32..=3, 6),
    ) {
        let collection: KeyedCollection<Probe> = KeyedCollection::new();
        let keys: Vec<String> = (0..current.len()).map(|n| format!("k{n}")).collect();
        for (key, v) in keys.iter().zip(&current) {
            let item = Probe::new(key);
            item.set_gain(f64::from(*v));
            collection.add(item).unwrap();
        }

        let events: Rc<RefCell<Vec<(Vec<String>, AttrNames)>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&events);
        collection.signals().items_changed().connect(move |ev: &(Vec<String>, AttrNames)| {
            sink.borrow_mut().push(ev.clone());
        });

        let target = &target[..current.len()];
        let values: Vec<f64> = target.iter().map(|v| f64::from(*v)).collect();
        let gains = nnav_model::column(
            "gain",
            values.clone(),
            |p: &Probe| p.gain(),
            |p: &Probe, v| p.set_gain(v),
        );
        collection.set_attr_for_many(&keys, &[&gains]).unwrap();

        let expected: Vec<String> = keys
            .iter()
            .zip(current.iter().zip(target))
            .filter(|(_, (cur, tgt))| cur != tgt)
            .map(|(key, _)| key.clone())
            .collect();

        let events = events.borrow();
        if expected.is_empty() {
            prop_assert!(events.is_empty());
        } else {
            prop_assert_eq!(events.len(), 1);
            prop_assert_eq!(&events[0], &(expected.clone(), attr_names(&["gain"])));
        }
        for (key, v) in keys.iter().zip(target) {
            prop_assert_eq!(collection.get(key).unwrap().gain(), f64::from(*v));
        }
    }
}
