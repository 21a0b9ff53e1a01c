//! reader-engine library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the `card-reader` binary share the same module tree.
//!
//! # What does reader-engine do? (for beginners)
//!
//! `reader-core` knows how to read the bytes a card reader produces.  This
//! crate knows how to *drive* the reader:
//!
//! 1. Find and open the reader (a USB HID device, or a simulated one).
//! 2. Send it a start-transaction command with the amount to charge.
//! 3. Listen to everything it reports (card inserted, timed out, ...) and
//!    track the transaction's status.
//! 4. When the encrypted card-data frame arrives, decode it and hand the
//!    result back to whoever started the transaction.
//!
//! Steps 2–4 race against a local timeout and against cancellation; exactly
//! one of them decides the outcome.

/// Application layer: transport capability, coordinator, dispatcher, service.
pub mod application;

/// Infrastructure layer: reader backends and configuration storage.
pub mod infrastructure;
