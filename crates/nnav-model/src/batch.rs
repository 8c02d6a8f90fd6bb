//! Attribute columns for batched writes.
//!
//! A batch write ("set the visibility of these five targets at once")
//! addresses several items and one or more attributes. Each attribute is
//! supplied as a column: one new value per addressed item plus the typed
//! accessor pair the collection uses to diff and apply. The collection
//! notifies once for the whole batch instead of once per item.

use std::marker::PhantomData;

use crate::approx::ApproxEq;

/// One attribute column in a batch write.
pub trait AttrColumn<T> {
    /// Attribute name carried in change notifications, spelled the way the
    /// item's dict form spells it.
    fn name(&self) -> &str;

    /// Number of rows; must match the number of addressed items.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the value at `row` differs from the item's current value.
    fn differs(&self, item: &T, row: usize) -> bool;

    /// Writes the value at `row` into the item. The item's own signals fire
    /// normally; the collection suppresses only its aggregate re-emission.
    fn apply(&self, item: &T, row: usize);
}

/// [`AttrColumn`] built from a getter/setter pair.
pub struct Column<T, V, G, S> {
    name: String,
    values: Vec<V>,
    read: G,
    write: S,
    _item: PhantomData<fn(&T)>,
}

/// Builds a column from per-row values and the item's accessor pair.
pub fn column<T, V, G, S>(
    name: impl Into<String>,
    values: Vec<V>,
    read: G,
    write: S,
) -> Column<T, V, G, S>
where
    V: ApproxEq + Clone,
    G: Fn(&T) -> V,
    S: Fn(&T, V),
{
    Column {
        name: name.into(),
        values,
        read,
        write,
        _item: PhantomData,
    }
}

impl<T, V, G, S> AttrColumn<T> for Column<T, V, G, S>
where
    V: ApproxEq + Clone,
    G: Fn(&T) -> V,
    S: Fn(&T, V),
{
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> usize {
        self.values.len()
    }

    fn differs(&self, item: &T, row: usize) -> bool {
        !(self.read)(item).approx_eq(&self.values[row])
    }

    fn apply(&self, item: &T, row: usize) {
        (self.write)(item, self.values[row].clone());
    }
}
