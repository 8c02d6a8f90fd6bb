//! Index-addressed observable list.
//!
//! Items do not track their own position. Signals therefore carry the item
//! handles themselves, and the current index of a changing item is resolved
//! by identity scan at emission time; a scan miss means the item left the
//! list while an emission was in flight, and the event is dropped silently.
//!
//! Structural mutations emit two signal families nested in a fixed envelope:
//! indices-about, items-about, mutate, items-changed, indices-changed. The
//! indices pair covers every item whose position shifts, even when its
//! content is untouched; the items pair covers only the items whose content
//! is involved. Content-only changes skip the indices pair entirely.
//!
//! # Invariants
//!
//! 1. Emitted item sets are deterministic: ascending pre-mutation position,
//!    with an incoming item last.
//! 2. A failed operation leaves the list unchanged and emits nothing.
//! 3. No entity occupies two slots at once (identity, not equality).
//! 4. Removed items are fully detached.

use std::cell::RefCell;
use std::rc::Rc;

use nnav_signal::ListenerId;
use nnav_signal::Signal;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::batch::AttrColumn;
use crate::error::{ModelError, Result};
use crate::item::{AttrNames, DictItem, ListItem};

// ─── Signals ─────────────────────────────────────────────────────────────────

/// Aggregated change signals for an indexed list.
pub struct ListSignals<T> {
    items_about_to_change: Signal<(Vec<T>, AttrNames)>,
    items_changed: Signal<(Vec<T>, AttrNames)>,
    item_indices_about_to_change: Signal<Vec<T>>,
    item_indices_changed: Signal<Vec<T>>,
}

impl<T> ListSignals<T> {
    fn new() -> Self {
        Self {
            items_about_to_change: Signal::new(),
            items_changed: Signal::new(),
            item_indices_about_to_change: Signal::new(),
            item_indices_changed: Signal::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn items_about_to_change(&self) -> &Signal<(Vec<T>, AttrNames)> {
        &self.items_about_to_change
    }

    #[inline]
    #[must_use]
    pub fn items_changed(&self) -> &Signal<(Vec<T>, AttrNames)> {
        &self.items_changed
    }

    /// Fires when item positions shift, even with content untouched.
    #[inline]
    #[must_use]
    pub fn item_indices_about_to_change(&self) -> &Signal<Vec<T>> {
        &self.item_indices_about_to_change
    }

    #[inline]
    #[must_use]
    pub fn item_indices_changed(&self) -> &Signal<Vec<T>> {
        &self.item_indices_changed
    }
}

// ─── List ────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy)]
struct Hooks {
    about: ListenerId,
    changed: ListenerId,
}

struct ListState<T> {
    items: Vec<(T, Hooks)>,
}

struct ListShell<T> {
    signals: ListSignals<T>,
    state: RefCell<ListState<T>>,
}

/// Ordered observable sequence of position-unaware items.
///
/// A cheap-clone handle; clones share one list.
pub struct IndexedList<T: ListItem> {
    shell: Rc<ListShell<T>>,
}

impl<T: ListItem> Clone for IndexedList<T> {
    fn clone(&self) -> Self {
        Self {
            shell: Rc::clone(&self.shell),
        }
    }
}

impl<T: ListItem> Default for IndexedList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ListItem> std::fmt::Debug for IndexedList<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexedList").field("len", &self.len()).finish()
    }
}

impl<T: ListItem> IndexedList<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shell: Rc::new(ListShell {
                signals: ListSignals::new(),
                state: RefCell::new(ListState { items: Vec::new() }),
            }),
        }
    }

    #[inline]
    #[must_use]
    pub fn signals(&self) -> &ListSignals<T> {
        &self.shell.signals
    }

    // ── Reads ──

    #[must_use]
    pub fn get(&self, index: usize) -> Option<T> {
        self.shell
            .state
            .borrow()
            .items
            .get(index)
            .map(|(item, _)| item.clone())
    }

    /// Current position of `item`, by identity.
    #[must_use]
    pub fn position_of(&self, item: &T) -> Option<usize> {
        self.shell
            .state
            .borrow()
            .items
            .iter()
            .position(|(held, _)| held.same_item(item))
    }

    #[must_use]
    pub fn items(&self) -> Vec<T> {
        self.shell
            .state
            .borrow()
            .items
            .iter()
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

    /// Appends `item`; fails if the same entity is already resident.
    pub fn append(&self, item: T) -> Result<()> {
        let at = self.len();
        self.insert(at, item)
    }

    /// Inserts `item` at `index`, shifting later items up.
    pub fn insert(&self, index: usize, item: T) -> Result<()> {
        {
            let state = self.shell.state.borrow();
            if index > state.items.len() {
                return Err(ModelError::IndexOutOfBounds {
                    index,
                    len: state.items.len(),
                });
            }
            if let Some(at) = state.items.iter().position(|(held, _)| held.same_item(&item)) {
                return Err(ModelError::ItemAlreadyPresent { index: at });
            }
        }

        let mut shifting: Vec<T> = {
            let state = self.shell.state.borrow();
            state.items[index..].iter().map(|(held, _)| held.clone()).collect()
        };
        shifting.push(item.clone());

        self.shell.signals.item_indices_about_to_change.emit(&shifting);
        let ev = (vec![item.clone()], None);
        self.shell.signals.items_about_to_change.emit(&ev);

        let hooks = connect_item(&self.shell, &item);
        self.shell.state.borrow_mut().items.insert(index, (item, hooks));

        self.shell.signals.items_changed.emit(&ev);
        self.shell.signals.item_indices_changed.emit(&shifting);
        Ok(())
    }

    /// Removes the given positions and returns the items in ascending
    /// position order.
    ///
    /// Duplicates in `indices` are collapsed; physical removal runs from the
    /// highest index down so earlier positions stay valid throughout. The
    /// indices pair covers the removed items plus every later survivor.
    pub fn delete_at(&self, indices: &[usize]) -> Result<Vec<T>> {
        let len = self.len();
        let mut descending: Vec<usize> = Vec::new();
        for &index in indices {
            if index >= len {
                return Err(ModelError::IndexOutOfBounds { index, len });
            }
            if !descending.contains(&index) {
                descending.push(index);
            }
        }
        if descending.is_empty() {
            return Ok(Vec::new());
        }
        descending.sort_unstable_by(|a, b| b.cmp(a));
        info!(indices = ?descending, "deleting list items");

        let lowest = descending[descending.len() - 1];
        let (deleting, shifting) = {
            let state = self.shell.state.borrow();
            let deleting: Vec<T> = (0..len)
                .filter(|idx| descending.contains(idx))
                .map(|idx| state.items[idx].0.clone())
                .collect();
            let shifting: Vec<T> = (0..len)
                .filter(|idx| descending.contains(idx) || *idx > lowest)
                .map(|idx| state.items[idx].0.clone())
                .collect();
            (deleting, shifting)
        };

        self.shell.signals.item_indices_about_to_change.emit(&shifting);
        let ev = (deleting.clone(), None);
        self.shell.signals.items_about_to_change.emit(&ev);

        for &index in &descending {
            let (item, hooks) = self.shell.state.borrow_mut().items.remove(index);
            disconnect_item(&item, hooks);
        }

        self.shell.signals.items_changed.emit(&ev);
        self.shell.signals.item_indices_changed.emit(&shifting);
        Ok(deleting)
    }

    /// Replaces the slot at `index` with `item`; `index == len` appends.
    ///
    /// Replacing a slot with the entity it already holds is a logged no-op.
    /// Both signal families carry the outgoing and incoming items.
    pub fn replace_at(&self, index: usize, item: T) -> Result<()> {
        let len = self.len();
        if index == len {
            return self.append(item);
        }
        if index > len {
            return Err(ModelError::IndexOutOfBounds { index, len });
        }
        let old = {
            let state = self.shell.state.borrow();
            if let Some(at) = state.items.iter().position(|(held, _)| held.same_item(&item)) {
                if at == index {
                    debug!(index, "slot already holds this item, nothing to do");
                    return Ok(());
                }
                return Err(ModelError::ItemAlreadyPresent { index: at });
            }
            state.items[index].0.clone()
        };

        let pair = vec![old.clone(), item.clone()];
        self.shell.signals.item_indices_about_to_change.emit(&pair);
        let ev = (pair.clone(), None);
        self.shell.signals.items_about_to_change.emit(&ev);

        let hooks = connect_item(&self.shell, &item);
        let (outgoing, outgoing_hooks) = {
            let mut state = self.shell.state.borrow_mut();
            std::mem::replace(&mut state.items[index], (item, hooks))
        };
        disconnect_item(&outgoing, outgoing_hooks);

        self.shell.signals.items_changed.emit(&ev);
        self.shell.signals.item_indices_changed.emit(&pair);
        Ok(())
    }

    /// Replaces the entire contents.
    ///
    /// Signals once with old items followed by new items not already
    /// resident. The incoming set must not hold the same entity twice.
    pub fn replace_all(&self, items: Vec<T>) -> Result<()> {
        for (later, item) in items.iter().enumerate() {
            if items[..later].iter().any(|earlier| earlier.same_item(item)) {
                return Err(ModelError::ItemAlreadyPresent { index: later });
            }
        }

        let mut involved: Vec<T> = self.items();
        for item in &items {
            if !involved.iter().any(|held| held.same_item(item)) {
                involved.push(item.clone());
            }
        }

        self.shell.signals.item_indices_about_to_change.emit(&involved);
        let ev = (involved.clone(), None);
        self.shell.signals.items_about_to_change.emit(&ev);

        let old: Vec<(T, Hooks)> = {
            let mut state = self.shell.state.borrow_mut();
            std::mem::take(&mut state.items)
        };
        for (item, hooks) in &old {
            disconnect_item(item, *hooks);
        }
        for item in items {
            let hooks = connect_item(&self.shell, &item);
            self.shell.state.borrow_mut().items.push((item, hooks));
        }

        self.shell.signals.items_changed.emit(&ev);
        self.shell.signals.item_indices_changed.emit(&involved);
        Ok(())
    }

    /// Writes attribute columns across the items at `indices`, signaling
    /// once with the items and attributes that actually differ.
    ///
    /// Positions are untouched, so only the items pair fires. The aggregate
    /// signals are suppressed while the writes run; the items' own signals
    /// still fire for outside listeners.
    pub fn set_attr_for_many(
        &self,
        indices: &[usize],
        columns: &[&dyn AttrColumn<T>],
    ) -> Result<()> {
        let len = self.len();
        for col in columns {
            if col.len() != indices.len() {
                return Err(ModelError::LengthMismatch {
                    attr: col.name().to_string(),
                    expected: indices.len(),
                    got: col.len(),
                });
            }
        }
        let mut targets: Vec<T> = Vec::with_capacity(indices.len());
        {
            let state = self.shell.state.borrow();
            for &index in indices {
                let Some((item, _)) = state.items.get(index) else {
                    return Err(ModelError::IndexOutOfBounds { index, len });
                };
                targets.push(item.clone());
            }
        }

        let mut changed_items: Vec<T> = Vec::new();
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
                changed_items.push(item.clone());
            }
        }
        if changed_items.is_empty() {
            return Ok(());
        }

        let ev = (changed_items, Some(changed_attrs));
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

    // ── Persistence ──

    /// Dict forms of all items, in order.
    #[must_use]
    pub fn to_list(&self) -> Vec<Map<String, Value>>
    where
        T: DictItem,
    {
        self.shell
            .state
            .borrow()
            .items
            .iter()
            .map(|(item, _)| item.to_dict())
            .collect()
    }
}

// ─── Item wiring ─────────────────────────────────────────────────────────────

fn connect_item<T: ListItem>(shell: &Rc<ListShell<T>>, item: &T) -> Hooks {
    let signals = item.signals();

    let weak = Rc::downgrade(shell);
    let about = signals
        .about_to_change()
        .connect(move |(item, attrs): &(T, AttrNames)| {
            let Some(shell) = weak.upgrade() else { return };
            let resident = shell
                .state
                .borrow()
                .items
                .iter()
                .any(|(held, _)| held.same_item(item));
            if !resident {
                // In-flight emission from an item a reentrant listener
                // already removed; drop it.
                return;
            }
            shell
                .signals
                .items_about_to_change
                .emit(&(vec![item.clone()], attrs.clone()));
        });

    let weak = Rc::downgrade(shell);
    let changed = signals
        .changed()
        .connect(move |(item, attrs): &(T, AttrNames)| {
            let Some(shell) = weak.upgrade() else { return };
            let resident = shell
                .state
                .borrow()
                .items
                .iter()
                .any(|(held, _)| held.same_item(item));
            if !resident {
                return;
            }
            shell
                .signals
                .items_changed
                .emit(&(vec![item.clone()], attrs.clone()));
        });

    Hooks { about, changed }
}

fn disconnect_item<T: ListItem>(item: &T, hooks: Hooks) {
    let signals = item.signals();
    let a = signals.about_to_change().disconnect(hooks.about);
    let b = signals.changed().disconnect(hooks.changed);
    debug_assert!(a.is_ok() && b.is_ok(), "item hook bookkeeping out of sync");
}

// ─── Tests ───────────────────────────────────────────────────────────────────
