// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire format of the monitor control socket.
//!
//! The monitored process sends fixed-size requests, native endian:
//! ```text
//! tid:   i32   thread to unwind
//! signo: i32   signal that triggered the request
//! ```
//! The monitor answers each request with the payload length it published, as a native-endian
//! `u32`. The monitored process never reads the answer while crashing; it watches the shared
//! region instead.

pub const REQUEST_SIZE: usize = 8;
pub const REPLY_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwindRequest {
    pub tid: i32,
    pub signo: i32,
}

impl UnwindRequest {
    /// Allocation free, usable from a signal handler.
    pub const fn to_bytes(self) -> [u8; REQUEST_SIZE] {
        let tid = self.tid.to_ne_bytes();
        let signo = self.signo.to_ne_bytes();
        [
            tid[0], tid[1], tid[2], tid[3], signo[0], signo[1], signo[2], signo[3],
        ]
    }

    pub fn from_bytes(bytes: [u8; REQUEST_SIZE]) -> Self {
        let [t0, t1, t2, t3, s0, s1, s2, s3] = bytes;
        Self {
            tid: i32::from_ne_bytes([t0, t1, t2, t3]),
            signo: i32::from_ne_bytes([s0, s1, s2, s3]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_layout() {
        let request = UnwindRequest {
            tid: 1234,
            signo: libc::SIGSEGV,
        };
        let bytes = request.to_bytes();
        assert_eq!(&bytes[..4], &1234i32.to_ne_bytes());
        assert_eq!(&bytes[4..], &libc::SIGSEGV.to_ne_bytes());
        assert_eq!(UnwindRequest::from_bytes(bytes), request);
    }
}
