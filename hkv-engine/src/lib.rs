//! Storage core for a memcached-style in-memory key-value cache (spec
//! §OVERVIEW). The engine never opens a socket or parses a wire protocol;
//! it exposes an in-process operation table a front-end drives, the same
//! separation the teacher draws between `hkv-engine` (storage core) and
//! `hkv-server` (network front-end).

pub mod clock;
pub mod eviction;
pub mod facade;
pub mod item;
pub mod notify;
pub mod slab;
pub mod stats;
pub mod table;

pub use facade::{
    create_instance, AddResponseArgs, AllocatedItem, ArithmeticOutcome, Cookie, Engine,
    EngineCallbacks, EngineHandle, RetrievedItem, SUPPORTED_VERSION,
};
pub use hkv_common::{EngineConfig, HkvError, HkvResult, Status, StoreOperation};
