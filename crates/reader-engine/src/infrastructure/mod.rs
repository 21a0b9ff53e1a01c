//! Infrastructure layer of the transaction engine.
//!
//! Contains the concrete reader backends and configuration persistence.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `reader_core`, but MUST NOT be imported by the `application` layer.
//!
//! # Sub-modules
//!
//! - **`transport`** – Implementations of `DeviceTransport`: the raw HID
//!   backend with its background read loop, the optional `hidapi` binding for
//!   it, and a push-model simulated reader.
//!
//! - **`storage`** – TOML configuration file loading and saving.

pub mod storage;
pub mod transport;
