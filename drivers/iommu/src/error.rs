//! # IOMMU Error Handling
//!
//! Error types for the translation engine.
//!
//! - Configuration errors are fatal: no domain can be built on the hardware.
//! - Range and alignment errors are rejected before any entry is touched.
//! - Timeouts are fatal on enable and soft-failed on invalidation.

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// IOMMU Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// Translation engine error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Hardware or configuration cannot support the two-level design
    Configuration(ConfigError),
    /// Address range lies (partly) outside the translated aperture
    OutOfRange,
    /// Address or length is not aligned to the native page size
    Misaligned,
    /// Translation query hit an invalid leaf entry
    NotMapped,
    /// Domain has no hardware instance attached
    NotAttached,
    /// Hardware instance is already attached to a domain
    AlreadyAttached,
    /// Requested domain type is not supported by this hardware
    UnsupportedDomain,
    /// DMA master is not served by this translation unit
    InvalidDevice,
    /// Domain was allocated by another translation unit
    ForeignDomain,
    /// External allocator could not provide table memory
    OutOfMemory,
    /// Hardware did not acknowledge a command within the poll bound
    HardwareTimeout,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration(e) => write!(f, "configuration error: {}", e),
            Self::OutOfRange => write!(f, "address range outside aperture"),
            Self::Misaligned => write!(f, "misaligned address or length"),
            Self::NotMapped => write!(f, "address not mapped"),
            Self::NotAttached => write!(f, "domain not attached"),
            Self::AlreadyAttached => write!(f, "IOMMU already attached"),
            Self::UnsupportedDomain => write!(f, "unsupported domain type"),
            Self::InvalidDevice => write!(f, "device not served by this IOMMU"),
            Self::ForeignDomain => write!(f, "domain belongs to another IOMMU"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::HardwareTimeout => write!(f, "hardware timeout"),
        }
    }
}

// =============================================================================
// SUB-ERROR TYPES
// =============================================================================

/// Reason a capability or configuration check failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Table format version predates two-level tables
    VersionTooOld(u8),
    /// Virtual address width below the usable minimum
    VaWidthTooSmall(u8),
    /// Physical address width below the usable minimum
    PaWidthTooSmall(u8),
    /// Hardware cannot pass addresses through untranslated
    NoBypass,
    /// Aperture base or size violates table layout constraints
    InvalidAperture,
    /// Host page size is smaller than the native page or does not tile the table
    InvalidHostPage,
    /// Table backing memory does not match the planned layout
    InvalidBacking,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VersionTooOld(v) => write!(f, "table version {} too old", v),
            Self::VaWidthTooSmall(w) => write!(f, "VA width field {} too small", w),
            Self::PaWidthTooSmall(w) => write!(f, "PA width field {} too small", w),
            Self::NoBypass => write!(f, "bypass capability missing"),
            Self::InvalidAperture => write!(f, "invalid aperture"),
            Self::InvalidHostPage => write!(f, "invalid host page size"),
            Self::InvalidBacking => write!(f, "invalid table backing"),
        }
    }
}

// =============================================================================
// ERROR CONVERSION
// =============================================================================

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Configuration(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_config_error_conversion() {
        let err: Error = ConfigError::NoBypass.into();
        assert_eq!(err, Error::Configuration(ConfigError::NoBypass));
        assert_eq!(err.to_string(), "configuration error: bypass capability missing");
    }
}
