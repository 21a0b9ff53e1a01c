//! Persistent configuration.

pub mod config;
