#![forbid(unsafe_code)]

//! Typed synchronous signal channels for session-model entities.
//!
//! A [`Signal`] is a single-threaded multicast channel: any number of
//! listeners connect to it, and [`Signal::emit`] invokes each of them in turn
//! before returning. Model entities pair these channels as
//! `about_to_change` / `changed` so observers can read state immediately
//! before and after a mutation.
//!
//! # Architecture
//!
//! `Signal<A>` is a cheap-clone handle over `Rc<RefCell<..>>`; clones share
//! one listener table. Listeners are identified by [`ListenerId`] (closures
//! have no usable identity of their own) and ordered by an integer priority,
//! highest first. Emission snapshots the table and releases all borrows
//! before invoking anything, so listeners may freely connect, disconnect,
//! mutate entities, or emit again.
//!
//! # Invariants
//!
//! 1. Dispatch is synchronous: `emit` returns only after every eligible
//!    listener has run.
//! 2. Priority tiers fire in descending order; ties fire in connection order.
//! 3. Suppression nests like a counter; an emission while suppressed is
//!    dropped, not queued.
//! 4. A listener disconnected mid-emission is skipped; one connected
//!    mid-emission first fires on the next emission.

pub mod signal;

pub use signal::{
    ConnectedScope, DisconnectedScope, ListenerId, Signal, SignalError, SuppressedScope,
};
