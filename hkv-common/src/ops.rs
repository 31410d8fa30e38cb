//! # Wire-Stable Operation Ordinals
//!
//! Purpose: Define the status codes and store-operation codes that cross
//! the engine façade boundary. These discriminants are part of the ABI
//! contract described in spec §6 and §9 and must never be renumbered, the
//! same stability posture the teacher crate gives `IoctlCommand`.
//!
//! ## Memory Layout
//!
//! ```text
//! Status (1 byte):
//! SUCCESS=0x00  KEY_ENOENT=0x01  KEY_EEXISTS=0x02  ENOMEM=0x03
//! NOT_STORED=0x04  EINVAL=0x05  ENOTSUP=0x06  EWOULDBLOCK=0x07
//! E2BIG=0x08  WANT_MORE=0x09  FAILED=0xff
//!
//! StoreOperation (1 byte):
//! ADD=1  SET=2  REPLACE=3  APPEND=4  PREPEND=5  CAS=6
//! ```

/// Wire-stable status ordinal returned by every façade operation.
///
/// `Status::Success` is the only "no error" value; every other variant is
/// surfaced to Rust callers as an [`crate::HkvError`] and only converted
/// back to this ordinal at the façade boundary (e.g. for `add_response`).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success = 0x00,
    KeyEnoent = 0x01,
    KeyEexists = 0x02,
    Enomem = 0x03,
    NotStored = 0x04,
    Einval = 0x05,
    Enotsup = 0x06,
    Ewouldblock = 0x07,
    E2big = 0x08,
    WantMore = 0x09,
    Failed = 0xff,
}

impl Status {
    /// Converts the ordinal to its raw wire byte.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Recovers a `Status` from its raw wire byte, if valid.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Success),
            0x01 => Some(Self::KeyEnoent),
            0x02 => Some(Self::KeyEexists),
            0x03 => Some(Self::Enomem),
            0x04 => Some(Self::NotStored),
            0x05 => Some(Self::Einval),
            0x06 => Some(Self::Enotsup),
            0x07 => Some(Self::Ewouldblock),
            0x08 => Some(Self::E2big),
            0x09 => Some(Self::WantMore),
            0xff => Some(Self::Failed),
            _ => None,
        }
    }

    /// Human-readable name, mainly for logging and `get_stats` output.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::KeyEnoent => "KEY_ENOENT",
            Self::KeyEexists => "KEY_EEXISTS",
            Self::Enomem => "ENOMEM",
            Self::NotStored => "NOT_STORED",
            Self::Einval => "EINVAL",
            Self::Enotsup => "ENOTSUP",
            Self::Ewouldblock => "EWOULDBLOCK",
            Self::E2big => "E2BIG",
            Self::WantMore => "WANT_MORE",
            Self::Failed => "FAILED",
        }
    }

    /// True for the four error families from spec §7 that the engine
    /// recovers from internally (capacity pressure) rather than surfacing
    /// as a hard client fault.
    pub const fn is_capacity_pressure(self) -> bool {
        matches!(self, Self::Enomem)
    }
}

/// `store` operation semantics, spec §4.5 / §6.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    Add = 1,
    Set = 2,
    Replace = 3,
    Append = 4,
    Prepend = 5,
    Cas = 6,
}

impl StoreOperation {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Add),
            2 => Some(Self::Set),
            3 => Some(Self::Replace),
            4 => Some(Self::Append),
            5 => Some(Self::Prepend),
            6 => Some(Self::Cas),
            _ => None,
        }
    }

    /// True for the two operations that concatenate rather than replace.
    pub const fn is_concatenation(self) -> bool {
        matches!(self, Self::Append | Self::Prepend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_ordinals_match_spec() {
        assert_eq!(Status::Success.as_u8(), 0x00);
        assert_eq!(Status::KeyEnoent.as_u8(), 0x01);
        assert_eq!(Status::KeyEexists.as_u8(), 0x02);
        assert_eq!(Status::Enomem.as_u8(), 0x03);
        assert_eq!(Status::NotStored.as_u8(), 0x04);
        assert_eq!(Status::Einval.as_u8(), 0x05);
        assert_eq!(Status::Enotsup.as_u8(), 0x06);
        assert_eq!(Status::Ewouldblock.as_u8(), 0x07);
        assert_eq!(Status::E2big.as_u8(), 0x08);
        assert_eq!(Status::WantMore.as_u8(), 0x09);
        assert_eq!(Status::Failed.as_u8(), 0xff);
    }

    #[test]
    fn status_round_trips() {
        for raw in 0u8..=0xffu8 {
            if let Some(status) = Status::from_u8(raw) {
                assert_eq!(status.as_u8(), raw);
            }
        }
    }

    #[test]
    fn store_operation_ordinals_match_spec() {
        assert_eq!(StoreOperation::Add.as_u8(), 1);
        assert_eq!(StoreOperation::Set.as_u8(), 2);
        assert_eq!(StoreOperation::Replace.as_u8(), 3);
        assert_eq!(StoreOperation::Append.as_u8(), 4);
        assert_eq!(StoreOperation::Prepend.as_u8(), 5);
        assert_eq!(StoreOperation::Cas.as_u8(), 6);
    }

    #[test]
    fn concatenation_classification() {
        assert!(StoreOperation::Append.is_concatenation());
        assert!(StoreOperation::Prepend.is_concatenation());
        assert!(!StoreOperation::Set.is_concatenation());
        assert!(!StoreOperation::Cas.is_concatenation());
    }
}
