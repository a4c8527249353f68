// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Platform version detection for gating client-side unwinding.

/// Whether client-side unwinding may be engaged on this device.
///
/// Derived once when the service is constructed and never recomputed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindCapability {
    Supported { platform_version: u32 },
    /// The platform reports a version below the minimum.
    TooOld { platform_version: u32, minimum: u32 },
    /// The version could not be determined.
    Unknown,
}

impl UnwindCapability {
    pub fn detect(minimum: u32) -> Self {
        Self::from_version(platform_version(), minimum)
    }

    pub fn from_version(version: Option<u32>, minimum: u32) -> Self {
        match version {
            Some(platform_version) if platform_version >= minimum => {
                Self::Supported { platform_version }
            }
            Some(platform_version) => Self::TooOld {
                platform_version,
                minimum,
            },
            None => Self::Unknown,
        }
    }

    pub fn is_supported(&self) -> bool {
        matches!(self, Self::Supported { .. })
    }
}

/// The Android API level of the running device, `None` elsewhere or if unreadable.
#[cfg(target_os = "android")]
pub fn platform_version() -> Option<u32> {
    use std::ffi::CStr;

    const PROP_VALUE_MAX: usize = 92;
    let mut value = [0 as libc::c_char; PROP_VALUE_MAX];
    // SAFETY: the name is NUL-terminated and `value` is PROP_VALUE_MAX bytes, as the API requires.
    let len = unsafe {
        libc::__system_property_get(c"ro.build.version.sdk".as_ptr(), value.as_mut_ptr())
    };
    if len <= 0 {
        return None;
    }
    // SAFETY: the property API always NUL-terminates within PROP_VALUE_MAX.
    let value = unsafe { CStr::from_ptr(value.as_ptr()) };
    parse_version(value.to_str().ok()?)
}

#[cfg(not(target_os = "android"))]
pub fn platform_version() -> Option<u32> {
    None
}

#[cfg_attr(not(target_os = "android"), allow(dead_code))]
fn parse_version(value: &str) -> Option<u32> {
    value.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_from_version() {
        assert_eq!(
            UnwindCapability::from_version(Some(29), 23),
            UnwindCapability::Supported {
                platform_version: 29
            }
        );
        assert!(UnwindCapability::from_version(Some(23), 23).is_supported());
        assert_eq!(
            UnwindCapability::from_version(Some(21), 23),
            UnwindCapability::TooOld {
                platform_version: 21,
                minimum: 23
            }
        );
        assert_eq!(
            UnwindCapability::from_version(None, 23),
            UnwindCapability::Unknown
        );
        assert!(!UnwindCapability::Unknown.is_supported());
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("33"), Some(33));
        assert_eq!(parse_version(" 28\n"), Some(28));
        assert_eq!(parse_version("S"), None);
        assert_eq!(parse_version(""), None);
    }

    #[cfg(not(target_os = "android"))]
    #[test]
    fn test_version_unknown_off_device() {
        assert_eq!(platform_version(), None);
        assert_eq!(UnwindCapability::detect(23), UnwindCapability::Unknown);
    }
}
