//! Keyed observable collection.
//!
//! Holds at most one item per key, preserves insertion order, and
//! aggregates the change signals of resident items into collection-level
//! signals so dependents subscribe once instead of once per item.
//!
//! # Invariants
//!
//! 1. Every mutation emits exactly one about/changed pair with identical
//!    payloads; `about` fires strictly before state changes, `changed`
//!    strictly after.
//! 2. A failed operation leaves the collection unchanged and emits nothing.
//! 3. Key uniqueness holds whenever no operation is mid-flight.
//! 4. Items removed from the collection are fully detached: their later
//!    mutations no longer re-emit here.
//!
//! # Failure Modes
//!
//! Checked operations report [`ModelError`]. Driving `set_key` directly on a
//! resident item whose target key collides bypasses the checked
//! [`KeyedCollection::rename`] path and panics before any state changes.

use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;
use nnav_signal::{ListenerId, Signal};
use serde_json::{Map, Value};
use tracing::info;

use crate::batch::AttrColumn;
use crate::error::{ModelError, Result};
use crate::item::{AttrNames, DictItem, ItemKey, KeyedItem};

// ─── Signals ─────────────────────────────────────────────────────────────────

/// Aggregated change signals for a keyed collection.
///
/// Item payloads are `(keys, attrs)`: the keys of the items involved, plus
/// the attribute names touched (`None` when anything may have changed).
/// The key pair fires in addition to the item pair when an item is re-keyed.
pub struct KeyedSignals<K: ItemKey> {
    items_about_to_change: Signal<(Vec<K>, AttrNames)>,
    items_changed: Signal<(Vec<K>, AttrNames)>,
    item_key_about_to_change: Signal<(K, K)>,
    item_key_changed: Signal<(K, K)>,
}

impl<K: ItemKey> KeyedSignals<K> {
    fn new() -> Self {
        Self {
            items_about_to_change: Signal::new(),
            items_changed: Signal::new(),
            item_key_about_to_change: Signal::new(),
            item_key_changed: Signal::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn items_about_to_change(&self) -> &Signal<(Vec<K>, AttrNames)> {
        &self.items_about_to_change
    }

    #[inline]
    #[must_use]
    pub fn items_changed(&self) -> &Signal<(Vec<K>, AttrNames)> {
        &self.items_changed
    }

    #[inline]
    #[must_use]
    pub fn item_key_about_to_change(&self) -> &Signal<(K, K)> {
        &self.item_key_about_to_change
    }

    #[inline]
    #[must_use]
    pub fn item_key_changed(&self) -> &Signal<(K, K)> {
        &self.item_key_changed
    }
}

// ─── Collection ──────────────────────────────────────────────────────────────

/// Listener ids for one resident item, removed symmetrically on exit.
#[derive(Clone, Copy)]
struct Hooks {
    about: ListenerId,
    changed: ListenerId,
    key_about: ListenerId,
    key_changed: ListenerId,
}

struct KeyedState<T: KeyedItem> {
    items: IndexMap<T::Key, (T, Hooks)>,
}

struct KeyedShell<T: KeyedItem> {
    signals: KeyedSignals<T::Key>,
    state: RefCell<KeyedState<T>>,
}

/// Insertion-ordered observable map of keyed items.
///
/// A cheap-clone handle; clones share one collection. Items are handles
/// too, so reading an item out and mutating it reaches the same entity the
/// collection holds, and the mutation re-emits here.
pub struct KeyedCollection<T: KeyedItem> {
    shell: Rc<KeyedShell<T>>,
}

impl<T: KeyedItem> Clone for KeyedCollection<T> {
    fn clone(&self) -> Self {
        Self {
            shell: Rc::clone(&self.shell),
        }
    }
}

impl<T: KeyedItem> Default for KeyedCollection<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: KeyedItem> std::fmt::Debug for KeyedCollection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedCollection")
            .field("len", &self.len())
            .finish()
    }
}

impl<T: KeyedItem> KeyedCollection<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shell: Rc::new(KeyedShell {
                signals: KeyedSignals::new(),
                state: RefCell::new(KeyedState {
                    items: IndexMap::new(),
                }),
            }),
        }
    }

    #[inline]
    #[must_use]
    pub fn signals(&self) -> &KeyedSignals<T::Key> {
        &self.shell.signals
    }

    // ── Reads ──

    #[must_use]
    pub fn get(&self, key: &T::Key) -> Option<T> {
        self.shell
            .state
            .borrow()
            .items
            .get(key)
            .map(|(item, _)| item.clone())
    }

    #[must_use]
    pub fn contains_key(&self, key: &T::Key) -> bool {
        self.shell.state.borrow().items.contains_key(key)
    }

    /// Insertion position of `key`, if resident.
    #[must_use]
    pub fn position(&self, key: &T::Key) -> Option<usize> {
        self.shell.state.borrow().items.get_index_of(key)
    }

    #[must_use]
    pub fn keys(&self) -> Vec<T::Key> {
        self.shell.state.borrow().items.keys().cloned().collect()
    }

    #[must_use]
    pub fn values(&self) -> Vec<T> {
        self.shell
            .state
            .borrow()
            .items
            .values()
            .map(|(item, _)| item.clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shell.state.borrow().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shell.state.borrow().items.is_empty()
    }

    // ── Mutations ──

    /// Inserts a new item; fails if its key is already resident.
    pub fn add(&self, item: T) -> Result<()> {
        let key = item.key();
        if self.contains_key(&key) {
            return Err(ModelError::DuplicateKey {
                key: key.to_string(),
            });
        }
        self.set_item(item);
        Ok(())
    }

    /// Inserts or replaces the item under its own key.
    ///
    /// A replaced resident is fully detached before the new item is wired
    /// in; the whole exchange signals as one change of `[key]`.
    pub fn set_item(&self, item: T) {
        let key = item.key();
        let ev = (vec![key.clone()], None);
        self.shell.signals.items_about_to_change.emit(&ev);
        let hooks = connect_item(&self.shell, &item);
        let prev = self
            .shell
            .state
            .borrow_mut()
            .items
            .insert(key, (item, hooks));
        if let Some((old, old_hooks)) = prev {
            disconnect_item(&old, old_hooks);
        }
        self.shell.signals.items_changed.emit(&ev);
    }

    /// Replaces the entire contents.
    ///
    /// Signals once with the union of old and new keys, `attrs = None`;
    /// reordering resident items goes through here too.
    pub fn set_many(&self, items: Vec<T>) {
        let mut keys = self.keys();
        for item in &items {
            let key = item.key();
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        let ev = (keys, None);
        self.shell.signals.items_about_to_change.emit(&ev);

        let old: Vec<(T, Hooks)> = {
            let mut state = self.shell.state.borrow_mut();
            state.items.drain(..).map(|(_, entry)| entry).collect()
        };
        for (item, hooks) in &old {
            disconnect_item(item, *hooks);
        }
        for item in items {
            let hooks = connect_item(&self.shell, &item);
            let prev = self
                .shell
                .state
                .borrow_mut()
                .items
                .insert(item.key(), (item, hooks));
            if let Some((dup, dup_hooks)) = prev {
                // Duplicate key inside the replacement set: last one wins.
                disconnect_item(&dup, dup_hooks);
            }
        }

        self.shell.signals.items_changed.emit(&ev);
    }

    /// Removes the given keys, all or nothing, and returns the items in
    /// argument order.
    pub fn delete(&self, keys: &[T::Key]) -> Result<Vec<T>> {
        let mut unique: Vec<T::Key> = Vec::new();
        {
            let state = self.shell.state.borrow();
            for key in keys {
                if !state.items.contains_key(key) {
                    return Err(ModelError::MissingKey {
                        key: key.to_string(),
                    });
                }
                if !unique.contains(key) {
                    unique.push(key.clone());
                }
            }
        }
        if unique.is_empty() {
            return Ok(Vec::new());
        }
        info!(keys = ?unique, "deleting collection items");

        let ev = (unique.clone(), None);
        self.shell.signals.items_about_to_change.emit(&ev);
        let mut removed = Vec::with_capacity(unique.len());
        for key in &unique {
            if let Some((item, hooks)) = self.shell.state.borrow_mut().items.shift_remove(key) {
                disconnect_item(&item, hooks);
                removed.push(item);
            }
        }
        self.shell.signals.items_changed.emit(&ev);
        Ok(removed)
    }

    /// Re-keys a resident item through the full key signal cascade.
    ///
    /// The checked counterpart to calling [`KeyedItem::set_key`] yourself:
    /// collisions and missing keys report as errors before anything fires.
    pub fn rename(&self, from: &T::Key, to: T::Key) -> Result<()> {
        if *from == to {
            return Ok(());
        }
        let item = {
            let state = self.shell.state.borrow();
            if state.items.contains_key(&to) {
                return Err(ModelError::KeyCollision {
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
            let Some((item, _)) = state.items.get(from) else {
                return Err(ModelError::MissingKey {
                    key: from.to_string(),
                });
            };
            item.clone()
        };
        item.set_key(to);
        Ok(())
    }

    /// Writes attribute columns across many items, signaling once.
    ///
    /// Values are diffed first (tolerantly, per the column); only items with
    /// at least one differing attribute appear in the notification, and the
    /// attribute list is the union of the attributes that actually differ.
    /// When nothing differs, nothing fires. The aggregate signals are
    /// suppressed while the writes run so per-item re-emission cannot double
    /// up; the items' own signals still fire for outside listeners.
    pub fn set_attr_for_many(
        &self,
        keys: &[T::Key],
        columns: &[&dyn AttrColumn<T>],
    ) -> Result<()> {
        for col in columns {
            if col.name() == "key" {
                return Err(ModelError::ReservedAttribute);
            }
            if col.len() != keys.len() {
                return Err(ModelError::LengthMismatch {
                    attr: col.name().to_string(),
                    expected: keys.len(),
                    got: col.len(),
                });
            }
        }

        let mut targets: Vec<T> = Vec::with_capacity(keys.len());
        {
            let state = self.shell.state.borrow();
            for key in keys {
                let Some((item, _)) = state.items.get(key) else {
                    return Err(ModelError::MissingKey {
                        key: key.to_string(),
                    });
                };
                targets.push(item.clone());
            }
        }

        let mut changed_keys: Vec<T::Key> = Vec::new();
        let mut changed_attrs: Vec<String> = Vec::new();
        let mut writes: Vec<(usize, usize)> = Vec::new();
        for (row, item) in targets.iter().enumerate() {
            let mut row_changed = false;
            for (ci, col) in columns.iter().enumerate() {
                if col.differs(item, row) {
                    row_changed = true;
                    writes.push((row, ci));
                    if !changed_attrs.iter().any(|name| name == col.name()) {
                        changed_attrs.push(col.name().to_string());
                    }
                }
            }
            if row_changed {
                changed_keys.push(keys[row].clone());
            }
        }
        if changed_keys.is_empty() {
            return Ok(());
        }

        let ev = (changed_keys, Some(changed_attrs));
        self.shell.signals.items_about_to_change.emit(&ev);
        {
            let _quiet_about = self.shell.signals.items_about_to_change.suppressed();
            let _quiet_changed = self.shell.signals.items_changed.suppressed();
            for (row, ci) in writes {
                columns[ci].apply(&targets[row], row);
            }
        }
        self.shell.signals.items_changed.emit(&ev);
        Ok(())
    }

    /// Adopts all of `items` (insert or replace per key) under one signal
    /// pair covering the incoming keys.
    pub fn merge(&self, items: Vec<T>) {
        if items.is_empty() {
            return;
        }
        let keys: Vec<T::Key> = items.iter().map(KeyedItem::key).collect();
        let ev = (keys, None);
        self.shell.signals.items_about_to_change.emit(&ev);
        {
            let _quiet_about = self.shell.signals.items_about_to_change.suppressed();
            let _quiet_changed = self.shell.signals.items_changed.suppressed();
            for item in items {
                self.set_item(item);
            }
        }
        self.shell.signals.items_changed.emit(&ev);
    }

    // ── Persistence ──

    /// Dict forms of all items, in insertion order.
    #[must_use]
    pub fn to_list(&self) -> Vec<Map<String, Value>>
    where
        T: DictItem,
    {
        self.shell
            .state
            .borrow()
            .items
            .values()
            .map(|(item, _)| item.to_dict())
            .collect()
    }
}

// ─── Item wiring ─────────────────────────────────────────────────────────────

fn connect_item<T: KeyedItem>(shell: &Rc<KeyedShell<T>>, item: &T) -> Hooks {
    let signals = item.signals();

    let weak = Rc::downgrade(shell);
    let about = signals
        .about_to_change()
        .connect(move |(key, attrs): &(T::Key, AttrNames)| {
            let Some(shell) = weak.upgrade() else { return };
            shell
                .signals
                .items_about_to_change
                .emit(&(vec![key.clone()], attrs.clone()));
        });

    let weak = Rc::downgrade(shell);
    let changed = signals
        .changed()
        .connect(move |(key, attrs): &(T::Key, AttrNames)| {
            let Some(shell) = weak.upgrade() else { return };
            shell
                .signals
                .items_changed
                .emit(&(vec![key.clone()], attrs.clone()));
        });

    let weak = Rc::downgrade(shell);
    let key_about = signals
        .key_about_to_change()
        .connect(move |(from, to): &(T::Key, T::Key)| {
            let Some(shell) = weak.upgrade() else { return };
            let collides = shell.state.borrow().items.contains_key(to);
            assert!(
                !collides,
                "cannot re-key `{from}` to `{to}`: target key is already present",
            );
            shell
                .signals
                .item_key_about_to_change
                .emit(&(from.clone(), to.clone()));
            shell
                .signals
                .items_about_to_change
                .emit(&(vec![from.clone(), to.clone()], None));
        });

    let weak = Rc::downgrade(shell);
    let key_changed = signals
        .key_changed()
        .connect(move |(from, to): &(T::Key, T::Key)| {
            let Some(shell) = weak.upgrade() else { return };
            let rekeyed = {
                let mut state = shell.state.borrow_mut();
                match state.items.get_index_of(from) {
                    Some(at) => match state.items.shift_remove_index(at) {
                        Some((_, entry)) => {
                            state.items.shift_insert(at, to.clone(), entry);
                            true
                        }
                        None => false,
                    },
                    // The item left the collection between the key pair.
                    None => false,
                }
            };
            if rekeyed {
                shell
                    .signals
                    .item_key_changed
                    .emit(&(from.clone(), to.clone()));
                shell
                    .signals
                    .items_changed
                    .emit(&(vec![from.clone(), to.clone()], None));
            }
        });

    Hooks {
        about,
        changed,
        key_about,
        key_changed,
    }
}

fn disconnect_item<T: KeyedItem>(item: &T, hooks: Hooks) {
    let signals = item.signals();
    let a = signals.about_to_change().disconnect(hooks.about);
    let b = signals.changed().disconnect(hooks.changed);
    let c = signals.key_about_to_change().disconnect(hooks.key_about);
    let d = signals.key_changed().disconnect(hooks.key_changed);
    debug_assert!(
        a.is_ok() && b.is_ok() && c.is_ok() && d.is_ok(),
        "item hook bookkeeping out of sync",
    );
}

// ─── Tests ───────────────────────────────────────────────────────────────────
