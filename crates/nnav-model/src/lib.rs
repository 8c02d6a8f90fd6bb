#![forbid(unsafe_code)]

//! Observable collection model: keyed and indexed aggregates of
//! signal-bearing items.
//!
//! Items are cheap-clone handles over shared entity state. A collection
//! holds item handles, subscribes to each resident item's change signals,
//! and re-emits them as collection-level aggregate events so dependents
//! subscribe in one place. Containers know their items; items never know
//! their containers.
//!
//! # Architecture
//!
//! - [`item`]: the item-side contract. [`ItemSignals`]/[`ListItemSignals`]
//!   bundle the about/changed pairs an item must carry; [`KeyedItem`] and
//!   [`ListItem`] are the traits collections require.
//! - [`keyed`]: [`KeyedCollection`], an insertion-ordered map keyed by each
//!   item's own key, with checked re-keying.
//! - [`list`]: [`IndexedList`], an ordered sequence of position-unaware
//!   items with separate content and index change signals.
//! - [`batch`]: [`AttrColumn`], the diff-then-write column used by the bulk
//!   attribute setters.
//! - [`approx`]: tolerant equality used when diffing numeric attributes.
//!
//! # Invariants
//!
//! 1. Every mutation emits a matched about/changed pair with identical
//!    payloads, about strictly before the state change.
//! 2. Failed operations are atomic: no state change, no emission.
//! 3. Listener callbacks may mutate the collection reentrantly; batch
//!    operations suppress their aggregate signals around the inner writes
//!    so nested emissions cannot double-notify.
//! 4. Signals arriving from items no longer resident are dropped silently.

pub mod approx;
pub mod batch;
pub mod error;
pub mod item;
pub mod keyed;
pub mod list;

pub use approx::ApproxEq;
pub use batch::{AttrColumn, Column, column};
pub use error::{ModelError, Result};
pub use item::{
    AttrNames, DictItem, ItemKey, ItemSignals, KeyedItem, ListItem, ListItemSignals, attr_names,
};
pub use keyed::{KeyedCollection, KeyedSignals};
pub use list::{IndexedList, ListSignals};
