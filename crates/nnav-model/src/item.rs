//! Item-side contracts for observable collections.
//!
//! Collection items are cheap-clone handles (`Rc`-backed) that own a bundle
//! of change signals. Containers subscribe to those signals when an item
//! moves in and disconnect when it moves out; items never hold a reference
//! to their container, so drop order can never cycle.
//!
//! Attribute names carried in change payloads use the same spelling as the
//! item's dict form (`meshKey`, `isVisible`, ..), so listeners and
//! serialization agree on what a field is called.

use std::fmt;
use std::hash::Hash;

use nnav_signal::Signal;
use serde_json::{Map, Value};

/// Key types usable for keyed collection items.
pub trait ItemKey: Clone + Eq + Hash + Ord + fmt::Debug + fmt::Display + 'static {}

impl<K: Clone + Eq + Hash + Ord + fmt::Debug + fmt::Display + 'static> ItemKey for K {}

/// Names of the attributes a change touches; `None` means anything may have
/// changed.
pub type AttrNames = Option<Vec<String>>;

/// Builds an [`AttrNames`] payload from literal names.
#[must_use]
pub fn attr_names(attrs: &[&str]) -> AttrNames {
    Some(attrs.iter().map(|a| (*a).to_string()).collect())
}

// ─── Keyed items ─────────────────────────────────────────────────────────────

/// Signal bundle owned by every keyed collection item.
///
/// `about_to_change` fires strictly before a mutation commits and `changed`
/// strictly after, both with identical payloads. Key changes use the
/// dedicated pair instead, because after a re-key everything else about the
/// item may look different to listeners that index by key.
pub struct ItemSignals<K: ItemKey> {
    about_to_change: Signal<(K, AttrNames)>,
    changed: Signal<(K, AttrNames)>,
    key_about_to_change: Signal<(K, K)>,
    key_changed: Signal<(K, K)>,
}

impl<K: ItemKey> Default for ItemSignals<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: ItemKey> ItemSignals<K> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            about_to_change: Signal::new(),
            changed: Signal::new(),
            key_about_to_change: Signal::new(),
            key_changed: Signal::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn about_to_change(&self) -> &Signal<(K, AttrNames)> {
        &self.about_to_change
    }

    #[inline]
    #[must_use]
    pub fn changed(&self) -> &Signal<(K, AttrNames)> {
        &self.changed
    }

    #[inline]
    #[must_use]
    pub fn key_about_to_change(&self) -> &Signal<(K, K)> {
        &self.key_about_to_change
    }

    #[inline]
    #[must_use]
    pub fn key_changed(&self) -> &Signal<(K, K)> {
        &self.key_changed
    }

    /// Emits the about/changed pair for `attrs` around `mutate`.
    ///
    /// The caller is responsible for the no-op check: only invoke this once
    /// the new value is known to differ from the current one.
    pub fn change_around<R>(&self, key: &K, attrs: &[&str], mutate: impl FnOnce() -> R) -> R {
        let ev = (key.clone(), attr_names(attrs));
        self.about_to_change.emit(&ev);
        let out = mutate();
        self.changed.emit(&ev);
        out
    }

    /// Emits the key pair around a key commit.
    pub fn rekey_around<R>(&self, from: &K, to: &K, mutate: impl FnOnce() -> R) -> R {
        let ev = (from.clone(), to.clone());
        self.key_about_to_change.emit(&ev);
        let out = mutate();
        self.key_changed.emit(&ev);
        out
    }
}

/// Contract for items held in a `KeyedCollection`.
///
/// Implementors are handles: `Clone` must alias the same underlying entity,
/// and [`KeyedItem::same_item`] must report aliasing identity (typically
/// `Rc::ptr_eq` on the entity's shell).
pub trait KeyedItem: Clone + 'static {
    type Key: ItemKey;

    /// The item's current key.
    fn key(&self) -> Self::Key;

    /// Re-keys the item, emitting the key signal pair. Must be a no-op when
    /// the key is unchanged.
    fn set_key(&self, key: Self::Key);

    /// The item's signal bundle.
    fn signals(&self) -> &ItemSignals<Self::Key>;

    /// Whether `other` aliases the same underlying entity.
    fn same_item(&self, other: &Self) -> bool;
}

// ─── List items ──────────────────────────────────────────────────────────────

/// Signal bundle owned by every list item.
///
/// List items do not know their index, so payloads carry the item handle
/// itself; the list resolves the current index at signal time.
pub struct ListItemSignals<T> {
    about_to_change: Signal<(T, AttrNames)>,
    changed: Signal<(T, AttrNames)>,
}

impl<T: Clone> Default for ListItemSignals<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> ListItemSignals<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            about_to_change: Signal::new(),
            changed: Signal::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn about_to_change(&self) -> &Signal<(T, AttrNames)> {
        &self.about_to_change
    }

    #[inline]
    #[must_use]
    pub fn changed(&self) -> &Signal<(T, AttrNames)> {
        &self.changed
    }

    /// Emits the about/changed pair for `attrs` around `mutate`.
    pub fn change_around<R>(&self, item: &T, attrs: &[&str], mutate: impl FnOnce() -> R) -> R {
        let ev = (item.clone(), attr_names(attrs));
        self.about_to_change.emit(&ev);
        let out = mutate();
        self.changed.emit(&ev);
        out
    }
}

/// Contract for items held in an `IndexedList`.
pub trait ListItem: Clone + 'static {
    /// The item's signal bundle.
    fn signals(&self) -> &ListItemSignals<Self>;

    /// Whether `other` aliases the same underlying entity.
    fn same_item(&self, other: &Self) -> bool;
}

// ─── Persistence ─────────────────────────────────────────────────────────────

/// Dict form of a persistable item.
///
/// Fields equal to their defaults are omitted so a freshly constructed item
/// round-trips to a minimal dict, byte for byte.
pub trait DictItem {
    fn to_dict(&self) -> Map<String, Value>;
}
