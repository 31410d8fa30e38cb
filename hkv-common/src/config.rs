//! # Configuration String Grammar
//!
//! Purpose: Parse the semicolon-separated `name=value` configuration string
//! that `initialize()` accepts (spec §4.5/§6) into a typed [`EngineConfig`].
//!
//! ## Design Principles
//!
//! 1. **Explicit Parsing Over Reflection**: every recognized key is matched
//!    by name; unknown keys are a hard `EINVAL`, not silently ignored,
//!    since a silently-dropped typo in `cache_size` would be a production
//!    incident waiting to happen.
//! 2. **Typed Defaults**: defaults mirror conventional memcached defaults so
//!    an empty configuration string still produces a usable engine.

use crate::error::{HkvError, HkvResult};

/// Default memory budget: 64 MiB.
pub const DEFAULT_CACHE_SIZE: u64 = 64 * 1024 * 1024;
/// Default slab growth factor.
pub const DEFAULT_FACTOR: f64 = 1.25;
/// Default base chunk size (`S_0`), spec §3.
pub const DEFAULT_CHUNK_SIZE: u32 = 96;
/// Default maximum value size: 1 MiB.
pub const DEFAULT_ITEM_SIZE_MAX: u32 = 1024 * 1024;
/// Default slab page size: 1 MiB, spec §3.
pub const SLAB_PAGE_SIZE: usize = 1024 * 1024;

/// Typed view of the `initialize()` configuration string.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Memory budget in bytes.
    pub cache_size: u64,
    /// Reserve all memory at initialization (spec §6). Not load-bearing for
    /// correctness in this implementation (slabs always grow lazily), but
    /// preserved as a recognized, validated option.
    pub preallocate: bool,
    /// Slab growth factor (`growth` in spec §3), must be `> 1.0`.
    pub factor: f64,
    /// Base slab class chunk size (`S_0`).
    pub chunk_size: u32,
    /// Maximum accepted value size (`VALUE_MAX`).
    pub item_size_max: u32,
    /// Whether LRU eviction runs on capacity pressure, or `ENOMEM` is
    /// returned instead (spec §6).
    pub eviction: bool,
    /// Whether items carry a CAS stamp. When `false`, `store(CAS, ...)`
    /// still validates the discriminant but never actually needs a fresh
    /// stamp for non-CAS operations to succeed.
    pub cas_enabled: bool,
    /// Diagnostic verbosity level, forwarded to `tracing` span filtering.
    pub verbose: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            cache_size: DEFAULT_CACHE_SIZE,
            preallocate: false,
            factor: DEFAULT_FACTOR,
            chunk_size: DEFAULT_CHUNK_SIZE,
            item_size_max: DEFAULT_ITEM_SIZE_MAX,
            eviction: true,
            cas_enabled: true,
            verbose: 0,
        }
    }
}

impl EngineConfig {
    /// Parses the `initialize()` configuration string.
    ///
    /// Empty input yields [`EngineConfig::default`]. Each `name=value` pair
    /// is separated by `;`; surrounding whitespace around names/values is
    /// trimmed. Unknown keys or malformed values return
    /// [`HkvError::InvalidConfig`].
    pub fn parse(input: &str) -> HkvResult<Self> {
        let mut config = EngineConfig::default();
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Ok(config);
        }

        for pair in trimmed.split(';') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (name, value) = pair.split_once('=').ok_or_else(|| HkvError::InvalidConfig {
                reason: format!("expected name=value, got '{pair}'"),
            })?;
            let name = name.trim();
            let value = value.trim();
            apply_option(&mut config, name, value)?;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> HkvResult<()> {
        if self.factor <= 1.0 {
            return Err(HkvError::InvalidConfig {
                reason: format!("factor must be > 1.0, got {}", self.factor),
            });
        }
        if self.chunk_size == 0 {
            return Err(HkvError::InvalidConfig {
                reason: "chunk_size must be > 0".to_string(),
            });
        }
        if self.item_size_max == 0 {
            return Err(HkvError::InvalidConfig {
                reason: "item_size_max must be > 0".to_string(),
            });
        }
        if self.cache_size == 0 {
            return Err(HkvError::InvalidConfig {
                reason: "cache_size must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

fn apply_option(config: &mut EngineConfig, name: &str, value: &str) -> HkvResult<()> {
    match name {
        "cache_size" => config.cache_size = parse_u64(name, value)?,
        "preallocate" => config.preallocate = parse_bool(name, value)?,
        "factor" => config.factor = parse_f64(name, value)?,
        "chunk_size" => config.chunk_size = parse_u32(name, value)?,
        "item_size_max" => config.item_size_max = parse_u32(name, value)?,
        "eviction" => config.eviction = parse_on_off(name, value)?,
        "cas_enabled" => config.cas_enabled = parse_bool(name, value)?,
        "verbose" => config.verbose = parse_u32(name, value)?.min(u8::MAX as u32) as u8,
        _ => {
            return Err(HkvError::InvalidConfig {
                reason: format!("unrecognized option '{name}'"),
            })
        }
    }
    Ok(())
}

fn parse_u64(name: &str, value: &str) -> HkvResult<u64> {
    value.parse::<u64>().map_err(|_| HkvError::InvalidConfig {
        reason: format!("'{name}' expects an unsigned integer, got '{value}'"),
    })
}

fn parse_u32(name: &str, value: &str) -> HkvResult<u32> {
    value.parse::<u32>().map_err(|_| HkvError::InvalidConfig {
        reason: format!("'{name}' expects an unsigned integer, got '{value}'"),
    })
}

fn parse_f64(name: &str, value: &str) -> HkvResult<f64> {
    value.parse::<f64>().map_err(|_| HkvError::InvalidConfig {
        reason: format!("'{name}' expects a floating-point number, got '{value}'"),
    })
}

fn parse_bool(name: &str, value: &str) -> HkvResult<bool> {
    match value {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(HkvError::InvalidConfig {
            reason: format!("'{name}' expects a boolean, got '{value}'"),
        }),
    }
}

fn parse_on_off(name: &str, value: &str) -> HkvResult<bool> {
    match value {
        "on" => Ok(true),
        "off" => Ok(false),
        _ => Err(HkvError::InvalidConfig {
            reason: format!("'{name}' expects 'on' or 'off', got '{value}'"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_yields_defaults() {
        let config = EngineConfig::parse("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn parses_recognized_options() {
        let config = EngineConfig::parse(
            "cache_size=1048576;factor=1.5;chunk_size=64;item_size_max=2048;eviction=off;cas_enabled=false;verbose=2",
        )
        .unwrap();
        assert_eq!(config.cache_size, 1_048_576);
        assert_eq!(config.factor, 1.5);
        assert_eq!(config.chunk_size, 64);
        assert_eq!(config.item_size_max, 2048);
        assert!(!config.eviction);
        assert!(!config.cas_enabled);
        assert_eq!(config.verbose, 2);
    }

    #[test]
    fn tolerates_surrounding_whitespace() {
        let config = EngineConfig::parse(" cache_size = 2048 ; factor = 1.3 ").unwrap();
        assert_eq!(config.cache_size, 2048);
        assert_eq!(config.factor, 1.3);
    }

    #[test]
    fn rejects_unknown_key() {
        let err = EngineConfig::parse("bogus=1").unwrap_err();
        assert_eq!(err.status(), crate::Status::Einval);
    }

    #[test]
    fn rejects_malformed_pair() {
        assert!(EngineConfig::parse("cache_size").is_err());
    }

    #[test]
    fn rejects_invalid_factor() {
        assert!(EngineConfig::parse("factor=1.0").is_err());
        assert!(EngineConfig::parse("factor=0.5").is_err());
    }

    #[test]
    fn trailing_semicolon_is_tolerated() {
        let config = EngineConfig::parse("cache_size=4096;").unwrap();
        assert_eq!(config.cache_size, 4096);
    }
}
