//! Retry/backoff engine for transient filesystem errors.
//!
//! Responsibilities:
//! - Classify `io::Error`s into transient (safe to retry) and fatal.
//! - Wrap fallible operations with a randomized backoff loop bounded by an
//!   absolute deadline computed once at the start of the call chain.
//! - Provide the narrower "change is acceptable" classification used for
//!   chmod/chown, where some failures mean "the platform does not support
//!   this" rather than "the write failed".

use std::io;
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::constants::{DEFAULT_RETRY_TIMEOUT, RETRY_BACKOFF_MAX, RETRY_BACKOFF_MIN};

/// How an `io::Error` should be treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Commonly caused by another process briefly holding a lock, an AV
    /// scanner, or descriptor-table pressure. Retry until the deadline.
    Transient,
    /// Genuine failure. Surface immediately.
    Fatal,
}

/// Deadline plus a pure classifier. Passed into [`with_retry`] instead of
/// wrapping each operation in an ad-hoc closure.
#[derive(Clone, Copy)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub classify: fn(&io::Error) -> ErrorClass,
}

impl RetryPolicy {
    /// Retry transient errors until `timeout` elapses.
    #[must_use]
    pub fn transient(timeout: Duration) -> Self {
        Self {
            timeout,
            classify: classify_transient,
        }
    }

    /// The default write-path policy (5 s deadline).
    #[must_use]
    pub fn default_io() -> Self {
        Self::transient(DEFAULT_RETRY_TIMEOUT)
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Run `op`, retrying transient failures with a randomized 100-500 ms
/// backoff until the policy deadline passes, then surface the last error.
///
/// The deadline is absolute: it is computed here, once, so a chain of
/// nested retried operations cannot stretch the overall timeout.
pub fn with_retry<T>(policy: &RetryPolicy, mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    let deadline = Instant::now() + policy.timeout;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) => {
                let now = Instant::now();
                if (policy.classify)(&err) == ErrorClass::Fatal || now >= deadline {
                    return Err(err);
                }
                let backoff = rand::thread_rng().gen_range(RETRY_BACKOFF_MIN..=RETRY_BACKOFF_MAX);
                let remaining = deadline - now;
                tracing::debug!(error = %err, backoff_ms = backoff.as_millis() as u64, "transient i/o error, backing off");
                thread::sleep(backoff.min(remaining));
            }
        }
    }
}

/// The write-path classifier. Permission errors are deliberately treated
/// as transient here: on desktop systems they routinely come from a
/// scanner or another process holding a short-lived lock on the file.
#[must_use]
pub fn classify_transient(err: &io::Error) -> ErrorClass {
    #[cfg(unix)]
    if let Some(code) = err.raw_os_error() {
        if code == libc::EMFILE
            || code == libc::ENFILE
            || code == libc::EAGAIN
            || code == libc::EBUSY
            || code == libc::EACCES
            || code == libc::EPERM
        {
            return ErrorClass::Transient;
        }
        return ErrorClass::Fatal;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::PermissionDenied => ErrorClass::Transient,
        _ => ErrorClass::Fatal,
    }
}

/// Classifier for chmod/chown on the temp file. `ENOSYS` means the
/// platform has no such call; `EINVAL`/`EPERM` without root privileges
/// means the permission model forbids it. Both are acceptable no-ops, not
/// write failures.
#[must_use]
pub fn metadata_change_acceptable(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        if let Some(code) = err.raw_os_error() {
            if code == libc::ENOSYS {
                return true;
            }
            let is_root = unsafe { libc::geteuid() } == 0;
            return (code == libc::EINVAL || code == libc::EPERM) && !is_root;
        }
        false
    }
    #[cfg(not(unix))]
    {
        matches!(
            err.kind(),
            io::ErrorKind::Unsupported | io::ErrorKind::PermissionDenied
        )
    }
}
