// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use nix::errno::Errno;
use std::ffi::{CString, NulError};

/// An `execve` call with every string already converted and null-terminated, so that the exec
/// itself can happen in a vfork child of a signal handler without touching the allocator.
// The `CString` vectors are only storage backing the pointer arrays.
#[allow(dead_code)]
#[derive(Debug)]
pub struct PreparedExecve {
    binary_path: CString,
    args_cstrings: Vec<CString>,
    args_ptrs: Vec<*const libc::c_char>,
    env_cstrings: Vec<CString>,
    env_ptrs: Vec<*const libc::c_char>,
}

// The raw pointers only ever point into the owned `CString`s above.
unsafe impl Send for PreparedExecve {}
unsafe impl Sync for PreparedExecve {}

#[derive(Debug, thiserror::Error)]
pub enum PreparedExecveError {
    #[error("Binary path contains a NUL byte: {0}")]
    BinaryPath(NulError),
    #[error("Argument contains a NUL byte: {0}")]
    Argument(NulError),
    #[error("Environment variable contains a NUL byte: {0}")]
    Environment(NulError),
}

fn null_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

impl PreparedExecve {
    /// `args` is the complete argv, including argv[0].
    pub fn new(
        binary_path: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<Self, PreparedExecveError> {
        let binary_path = CString::new(binary_path).map_err(PreparedExecveError::BinaryPath)?;
        let args_cstrings = args
            .iter()
            .map(|arg| CString::new(arg.as_str()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(PreparedExecveError::Argument)?;
        let env_cstrings = env
            .iter()
            .map(|(key, value)| CString::new(format!("{key}={value}")))
            .collect::<Result<Vec<_>, _>>()
            .map_err(PreparedExecveError::Environment)?;

        let args_ptrs = null_terminated(&args_cstrings);
        let env_ptrs = null_terminated(&env_cstrings);
        Ok(Self {
            binary_path,
            args_cstrings,
            args_ptrs,
            env_cstrings,
            env_ptrs,
        })
    }

    pub fn argc(&self) -> usize {
        self.args_cstrings.len()
    }

    /// Replaces the current process image. Only returns on failure.
    pub fn exec(&self) -> Result<(), Errno> {
        // Safety: `new` guarantees both arrays are null-terminated and point at live CStrings.
        let rval = unsafe {
            libc::execve(
                self.binary_path.as_ptr(),
                self.args_ptrs.as_ptr(),
                self.env_ptrs.as_ptr(),
            )
        };
        if rval == -1 {
            Err(Errno::last())
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    // exec() is exercised by the end-to-end tests; calling it here would replace the test runner.
    use super::*;

    #[test]
    fn test_prepared_execve_keeps_argv() {
        let args = vec!["handler".to_string(), "--no-rate-limit".to_string()];
        let env = vec![("PATH".to_string(), "/bin".to_string())];
        let prepared = PreparedExecve::new("/bin/true", &args, &env).unwrap();
        assert_eq!(prepared.argc(), 2);
        assert_eq!(prepared.args_ptrs.len(), 3);
        assert!(prepared.args_ptrs[2].is_null());
        assert!(prepared.env_ptrs[1].is_null());
    }

    #[test]
    fn test_prepared_execve_rejects_nul_bytes() {
        assert!(matches!(
            PreparedExecve::new("/bin/te\0st", &[], &[]),
            Err(PreparedExecveError::BinaryPath(_))
        ));
        assert!(matches!(
            PreparedExecve::new("/bin/true", &["a\0b".to_string()], &[]),
            Err(PreparedExecveError::Argument(_))
        ));
        assert!(matches!(
            PreparedExecve::new("/bin/true", &[], &[("K\0".to_string(), "v".to_string())]),
            Err(PreparedExecveError::Environment(_))
        ));
    }

    #[test]
    fn test_prepared_execve_unicode() {
        let args = vec!["--annotation=name=🦀".to_string()];
        assert!(PreparedExecve::new("/bin/echo", &args, &[]).is_ok());
    }
}
