// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Logging and Diagnostics
//!
//! Thin logging macros over the `log` facade. Every IOMMU operation logs with
//! the device name as the target, so a platform logger can filter per MMU
//! instance (`gsp`, `mm`, `disp`).
//!
//! # Usage
//!
//! ```rust,ignore
//! log_debug!(target: self.name(), "map {:#x}+{:#x}", range.start, range.len);
//! log_warn!("teardown with {} live mappings", live);
//! ```
//!
//! With the `logging` feature disabled the macros still type-check their
//! arguments but emit nothing.

#[cfg(feature = "logging")]
#[doc(hidden)]
pub use log as __private_log;

#[cfg(feature = "logging")]
#[doc(hidden)]
#[macro_export]
macro_rules! __iommu_log {
    ($level:ident, target: $target:expr, $($arg:tt)*) => {
        $crate::debug::__private_log::$level!(target: $target, $($arg)*)
    };
    ($level:ident, $($arg:tt)*) => {
        $crate::debug::__private_log::$level!($($arg)*)
    };
}

#[cfg(not(feature = "logging"))]
#[doc(hidden)]
#[macro_export]
macro_rules! __iommu_log {
    ($level:ident, target: $target:expr, $($arg:tt)*) => {{
        let _ = $target;
        let _ = ::core::format_args!($($arg)*);
    }};
    ($level:ident, $($arg:tt)*) => {{
        let _ = ::core::format_args!($($arg)*);
    }};
}

/// Log a trace message
#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => { $crate::__iommu_log!(trace, $($arg)*) };
}

/// Log a debug message
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => { $crate::__iommu_log!(debug, $($arg)*) };
}

/// Log an info message
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => { $crate::__iommu_log!(info, $($arg)*) };
}

/// Log a warning message
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => { $crate::__iommu_log!(warn, $($arg)*) };
}

/// Log an error message
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => { $crate::__iommu_log!(error, $($arg)*) };
}
