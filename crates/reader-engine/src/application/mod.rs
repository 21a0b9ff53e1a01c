//! Application layer of the transaction engine.
//!
//! # What lives here? (for beginners)
//!
//! - **`transport`** – The [`transport::DeviceTransport`] capability every
//!   reader backend implements.  The coordinator and dispatcher are written
//!   once against this trait; the HID and simulated backends live in the
//!   infrastructure layer.
//!
//! - **`coordinator`** – Owns the single live transaction: starts it, races
//!   the device against a local timeout, and hands exactly one outcome back
//!   to the waiting caller.
//!
//! - **`dispatcher`** – Classifies every message the reader sends and routes
//!   it to the coordinator or the observers.
//!
//! - **`notifier`** – Broadcasts connection, status, card-data, display, and
//!   log notifications to any number of observers.
//!
//! - **`service`** – The facade that wires all of the above together.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod coordinator;
pub mod dispatcher;
pub mod notifier;
pub mod service;
pub mod transport;

/// Locks `mutex`, recovering the guard if a previous holder panicked.
///
/// Every critical section in this crate leaves its state consistent before
/// any call that could panic, so a poisoned lock is still safe to use.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
