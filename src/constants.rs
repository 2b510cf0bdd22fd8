//! Crate-wide limits and tunables.

use std::time::Duration;

/// Reserved top-level key holding engine-managed metadata.
pub const INTERNAL_KEY: &str = "__internal__";

/// Dot-path under [`INTERNAL_KEY`] where the migration watermark lives.
pub const MIGRATION_KEY: &str = "__internal__.migrations.version";

/// Watermark assumed for a store that has never been migrated.
pub const INITIAL_VERSION: &str = "0.0.0";

/// Maximum basename length for temp files and for the one truncated
/// rename retry after `ENAMETOOLONG`.
pub const LIMIT_BASENAME_LENGTH: usize = 128;

/// Suffix marker inserted between the original basename and the
/// epoch/random tail of a temp file.
pub const TEMP_MARKER: &str = ".tmp-";

/// Number of random hex characters in a temp file name.
pub const TEMP_RANDOM_LEN: usize = 6;

/// Randomized backoff window between retries of a transient failure.
pub const RETRY_BACKOFF_MIN: Duration = Duration::from_millis(100);
pub const RETRY_BACKOFF_MAX: Duration = Duration::from_millis(500);

/// Default deadline for a retried filesystem operation.
pub const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Ceiling on concurrently open descriptors held by one durability context.
pub const DESCRIPTOR_CEILING: usize = 10_000;

/// How long a throttled waiter sleeps before re-checking capacity.
pub const THROTTLE_TICK: Duration = Duration::from_millis(25);

/// Poll interval of the external-change watcher thread.
pub const WATCH_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Default mode for a freshly created config file (subject to umask).
pub const DEFAULT_FILE_MODE: u32 = 0o666;

/// Default mode for directories created on the way to the config file.
pub const DEFAULT_DIR_MODE: u32 = 0o777;

/// Size of the random IV prepended to the encryption envelope.
pub const ENVELOPE_IV_LEN: usize = 16;

/// Separator between IV and ciphertext in the current envelope format.
pub const ENVELOPE_SEPARATOR: u8 = b':';

/// PBKDF2 iteration count for envelope key derivation.
pub const ENVELOPE_KDF_ROUNDS: u32 = 10_000;
