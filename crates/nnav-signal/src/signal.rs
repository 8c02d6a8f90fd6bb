//! Priority-ordered multicast signal channel.
//!
//! The core primitive behind all model change notification. See the crate
//! docs for the dispatch invariants.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use thiserror::Error;

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Errors from signal connection bookkeeping.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SignalError {
    /// The given listener id is not currently connected to this signal.
    #[error("listener {0} is not connected")]
    NotConnected(ListenerId),
}

// ─── ListenerId ──────────────────────────────────────────────────────────────

/// Identifies one connected listener.
///
/// Ids are unique per signal for the lifetime of the signal and are never
/// reused, so a stale id held after a disconnect can only produce
/// [`SignalError::NotConnected`], never target the wrong listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ─── Signal ──────────────────────────────────────────────────────────────────

type Listener<A> = Rc<dyn Fn(&A)>;

struct Entry<A> {
    id: ListenerId,
    priority: i32,
    listener: Listener<A>,
}

struct Inner<A> {
    /// Sorted by priority descending, connection order within a tier.
    entries: Vec<Entry<A>>,
    next_id: u64,
    suppress_depth: usize,
}

impl<A> Inner<A> {
    fn insert_entry(&mut self, entry: Entry<A>) {
        let at = self
            .entries
            .partition_point(|e| e.priority >= entry.priority);
        self.entries.insert(at, entry);
    }

    fn position(&self, id: ListenerId) -> Option<usize> {
        self.entries.iter().position(|e| e.id == id)
    }
}

/// A typed synchronous multicast channel.
///
/// Listeners receive the emitted payload by reference. `Signal` is a handle:
/// cloning it yields another handle onto the same channel.
///
/// # Example
///
/// ```
/// use nnav_signal::Signal;
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// let sig: Signal<i32> = Signal::new();
/// let seen = Rc::new(Cell::new(0));
/// let seen2 = Rc::clone(&seen);
/// sig.connect(move |v| seen2.set(*v));
/// sig.emit(&7);
/// assert_eq!(seen.get(), 7);
/// ```
pub struct Signal<A> {
    inner: Rc<RefCell<Inner<A>>>,
}

impl<A> Clone for Signal<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<A> Default for Signal<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> fmt::Debug for Signal<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Signal")
            .field("listeners", &inner.entries.len())
            .field("suppress_depth", &inner.suppress_depth)
            .finish()
    }
}

impl<A> Signal<A> {
    /// Creates a channel with no listeners.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                entries: Vec::new(),
                next_id: 0,
                suppress_depth: 0,
            })),
        }
    }

    // ── Connections ──

    /// Connects a listener at the default priority (0).
    pub fn connect(&self, listener: impl Fn(&A) + 'static) -> ListenerId {
        self.connect_with_priority(listener, 0)
    }

    /// Connects a listener at the given priority. Higher priorities fire
    /// first; listeners sharing a priority fire in connection order.
    pub fn connect_with_priority(
        &self,
        listener: impl Fn(&A) + 'static,
        priority: i32,
    ) -> ListenerId {
        let mut inner = self.inner.borrow_mut();
        let id = ListenerId(inner.next_id);
        inner.next_id += 1;
        inner.insert_entry(Entry {
            id,
            priority,
            listener: Rc::new(listener),
        });
        id
    }

    /// Removes a listener, returning the priority it was connected at.
    pub fn disconnect(&self, id: ListenerId) -> Result<i32, SignalError> {
        let mut inner = self.inner.borrow_mut();
        let at = inner.position(id).ok_or(SignalError::NotConnected(id))?;
        let entry = inner.entries.remove(at);
        Ok(entry.priority)
    }

    /// Number of currently connected listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.borrow().entries.len()
    }

    // ── Emission ──

    /// Invokes every connected listener with `args`, highest priority first.
    ///
    /// A no-op while the signal is suppressed. The listener table is
    /// snapshotted up front and membership is re-checked per listener, so a
    /// listener disconnected by an earlier listener in the same emission is
    /// skipped, and one connected during the emission does not run until the
    /// next one. Listeners may emit on this signal reentrantly.
    pub fn emit(&self, args: &A) {
        let snapshot: Vec<(ListenerId, Listener<A>)> = {
            let inner = self.inner.borrow();
            if inner.suppress_depth > 0 {
                return;
            }
            inner
                .entries
                .iter()
                .map(|e| (e.id, Rc::clone(&e.listener)))
                .collect()
        };
        for (id, listener) in snapshot {
            let still_connected = self.inner.borrow().position(id).is_some();
            if still_connected {
                listener(args);
            }
        }
    }

    // ── Suppression ──

    /// Suppresses emission until the returned scope is dropped. Nested
    /// scopes stack; emissions attempted while any scope is live are
    /// dropped entirely, not queued.
    #[must_use = "suppression ends as soon as the scope is dropped"]
    pub fn suppressed(&self) -> SuppressedScope<A> {
        self.inner.borrow_mut().suppress_depth += 1;
        SuppressedScope {
            inner: Rc::clone(&self.inner),
        }
    }

    /// Whether at least one suppression scope is live.
    #[must_use]
    pub fn is_suppressed(&self) -> bool {
        self.inner.borrow().suppress_depth > 0
    }

    // ── Scoped connections ──

    /// Connects a listener for the lifetime of the returned scope.
    #[must_use = "the listener disconnects as soon as the scope is dropped"]
    pub fn connected(&self, listener: impl Fn(&A) + 'static) -> ConnectedScope<A> {
        self.connected_with_priority(listener, 0)
    }

    /// Like [`Signal::connected`], at the given priority.
    #[must_use = "the listener disconnects as soon as the scope is dropped"]
    pub fn connected_with_priority(
        &self,
        listener: impl Fn(&A) + 'static,
        priority: i32,
    ) -> ConnectedScope<A> {
        let id = self.connect_with_priority(listener, priority);
        ConnectedScope {
            signal: self.clone(),
            id,
        }
    }

    /// Temporarily removes a listener; dropping the scope reconnects it
    /// under the same id, at the end of its original priority tier.
    #[must_use = "the listener reconnects as soon as the scope is dropped"]
    pub fn disconnected(&self, id: ListenerId) -> Result<DisconnectedScope<A>, SignalError> {
        let mut inner = self.inner.borrow_mut();
        let at = inner.position(id).ok_or(SignalError::NotConnected(id))?;
        let entry = inner.entries.remove(at);
        drop(inner);
        Ok(DisconnectedScope {
            inner: Rc::clone(&self.inner),
            entry: Some(entry),
        })
    }
}

// ─── Scopes ──────────────────────────────────────────────────────────────────

/// Holds one level of suppression on a [`Signal`].
pub struct SuppressedScope<A> {
    inner: Rc<RefCell<Inner<A>>>,
}

impl<A> Drop for SuppressedScope<A> {
    fn drop(&mut self) {
        let mut inner = self.inner.borrow_mut();
        inner.suppress_depth = inner.suppress_depth.saturating_sub(1);
    }
}

/// Keeps a listener connected until dropped.
pub struct ConnectedScope<A> {
    signal: Signal<A>,
    id: ListenerId,
}

impl<A> ConnectedScope<A> {
    /// Id of the scoped listener, usable with [`Signal::disconnected`].
    #[must_use]
    pub fn id(&self) -> ListenerId {
        self.id
    }
}

impl<A> Drop for ConnectedScope<A> {
    fn drop(&mut self) {
        // The listener may already have been removed through the id.
        let _ = self.signal.disconnect(self.id);
    }
}

/// Keeps a listener disconnected until dropped.
pub struct DisconnectedScope<A> {
    inner: Rc<RefCell<Inner<A>>>,
    entry: Option<Entry<A>>,
}

impl<A> DisconnectedScope<A> {
    /// Id the listener will be restored under.
    #[must_use]
    pub fn id(&self) -> ListenerId {
        // entry is only taken in drop
        self.entry.as_ref().map(|e| e.id).unwrap_or(ListenerId(0))
    }

    /// Priority the listener will be restored at.
    #[must_use]
    pub fn priority(&self) -> i32 {
        self.entry.as_ref().map(|e| e.priority).unwrap_or(0)
    }
}

impl<A> Drop for DisconnectedScope<A> {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            self.inner.borrow_mut().insert_entry(entry);
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
