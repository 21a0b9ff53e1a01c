//! Domain types for the transaction engine.
//!
//! This module contains pure business logic with no infrastructure dependencies.
//!
//! # What lives here (for beginners)
//!
//! The *domain* layer describes what a card-present transaction **is**,
//! independent of how the reader is attached:
//!
//! - [`amount::Amount`] is money held as integer cents, so no floating-point
//!   rounding ever reaches the reader or the gateway.
//! - [`transaction`] holds the status enums and a small state machine that
//!   tracks one transaction from "waiting for card" to a terminal outcome.
//!
//! Code in outer layers (the engine's transports and coordinator) depends on
//! the domain, but the domain never depends on them.

pub mod amount;

/// Statuses, payment methods, and the per-transaction state machine.
pub mod transaction;
