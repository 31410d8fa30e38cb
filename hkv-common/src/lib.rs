//! Shared types, error handling, and configuration grammar for the key-value
//! engine. `hkv-engine` is the only downstream consumer, but the split keeps
//! the wire-stable ordinals and configuration parser independent of the
//! engine's own internal state.

pub mod config;
pub mod error;
pub mod ops;
pub mod time;

pub use config::EngineConfig;
pub use error::{HkvError, HkvResult};
pub use ops::{Status, StoreOperation};

/// Maximum key length in bytes, spec §3.
pub const KEY_MAX: usize = 250;

/// Maximum value length in bytes the engine will ever accept, independent of
/// any configured `item_size_max` (which may only tighten this bound).
pub const VALUE_MAX: usize = 1024 * 1024;
