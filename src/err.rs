// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! IOMMU Error Codes
//!
//! Every public operation returns [`Result`]. Nothing is logged and dropped:
//! a failing call always surfaces one of these codes to the calling driver.

use core::fmt;

/// Status code type used by the calling drivers
pub type Status = i32;

/// Success status code
pub const IOMMU_OK: Status = 0;

/// IOMMU errors
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IommuError {
    /// IOVA window exhausted
    OutOfSpace = 1,

    /// Range not currently owned by the caller
    InvalidRange = 2,

    /// Range already carries a live mapping
    AlreadyMapped = 3,

    /// Range has no live mapping
    NotMapped = 4,

    /// Scatter-gather length differs from the IOVA range length
    SizeMismatch = 5,

    /// Page-table write could not be confirmed
    HardwareFault = 6,

    /// Clock/power substrate refused to enable
    PowerGateUnavailable = 7,

    /// Clock/power substrate did not settle in time
    PowerGateTimeout = 8,

    /// Misaligned, zero-sized or otherwise malformed argument
    InvalidArgument = 9,

    /// Device has not been initialized (or has been torn down)
    NotInitialized = 10,

    /// Device was already initialized
    AlreadyInitialized = 11,
}

impl IommuError {
    /// Convert to a raw negative status code
    pub const fn as_raw(self) -> Status {
        -(self as i32)
    }

    /// Recover an error from a raw status code
    pub const fn from_raw(status: Status) -> Option<Self> {
        let code = match status.checked_neg() {
            Some(code) => code,
            None => return None,
        };
        Some(match code {
            1 => Self::OutOfSpace,
            2 => Self::InvalidRange,
            3 => Self::AlreadyMapped,
            4 => Self::NotMapped,
            5 => Self::SizeMismatch,
            6 => Self::HardwareFault,
            7 => Self::PowerGateUnavailable,
            8 => Self::PowerGateTimeout,
            9 => Self::InvalidArgument,
            10 => Self::NotInitialized,
            11 => Self::AlreadyInitialized,
            _ => return None,
        })
    }

    /// Short name of the error
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OutOfSpace => "out of IOVA space",
            Self::InvalidRange => "range not owned",
            Self::AlreadyMapped => "range already mapped",
            Self::NotMapped => "range not mapped",
            Self::SizeMismatch => "scatter-gather size mismatch",
            Self::HardwareFault => "page-table write not confirmed",
            Self::PowerGateUnavailable => "power gate unavailable",
            Self::PowerGateTimeout => "power gate timed out",
            Self::InvalidArgument => "invalid argument",
            Self::NotInitialized => "device not initialized",
            Self::AlreadyInitialized => "device already initialized",
        }
    }
}

impl fmt::Display for IommuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result type for IOMMU operations
pub type Result<T = ()> = core::result::Result<T, IommuError>;

/// Collapse a result into a status code for C-style callers
pub fn to_status(result: Result) -> Status {
    match result {
        Ok(()) => IOMMU_OK,
        Err(err) => err.as_raw(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_codes_are_negative() {
        assert_eq!(IommuError::OutOfSpace.as_raw(), -1);
        assert_eq!(IommuError::PowerGateTimeout.as_raw(), -8);
    }

    #[test]
    fn test_from_raw() {
        assert_eq!(
            IommuError::from_raw(IommuError::NotMapped.as_raw()),
            Some(IommuError::NotMapped)
        );
        assert_eq!(IommuError::from_raw(0), None);
        assert_eq!(IommuError::from_raw(-99), None);
        assert_eq!(IommuError::from_raw(i32::MIN), None);
        assert_eq!(IommuError::from_raw(i32::MAX), None);
    }

    #[test]
    fn test_to_status() {
        assert_eq!(to_status(Ok(())), IOMMU_OK);
        assert_eq!(to_status(Err(IommuError::HardwareFault)), -6);
    }
}
