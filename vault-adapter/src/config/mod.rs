//! Configuration module for the dual-tier storage adapter
//!
//! One explicit `StorageConfig` value is built at startup (defaults, TOML file and
//! `VAULT_ADAPTER_*` environment overrides) and validated before any I/O happens.

pub mod types;

pub use types::*;
