//! Atomic temp-file-swap writer and retrying reader.
//!
//! Responsibilities:
//! - Write a full payload to an ephemeral sibling temp file, fsync, then
//!   rename it onto the target so the target is never half-written.
//! - Inherit mode/ownership from an existing target unless told otherwise.
//! - Serialize per path, throttle descriptors, retry transient errors.
//! - On failure, unlink the temp file and leave the original untouched.

// std::fs rather than fs_err throughout this module: the retry classifier
// reads raw_os_error(), which fs_err's wrapped errors do not carry.
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::RngCore;

use crate::constants::{
    DEFAULT_DIR_MODE, DEFAULT_FILE_MODE, DEFAULT_RETRY_TIMEOUT, LIMIT_BASENAME_LENGTH,
    TEMP_MARKER, TEMP_RANDOM_LEN,
};
use crate::context::DurabilityContext;
use crate::error::Result;
use crate::retry::{RetryPolicy, with_retry};

/// When (and whether) the temp file is flushed to stable storage before
/// the rename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FsyncMode {
    /// Block until the kernel confirms the flush. The default.
    #[default]
    Sync,
    /// Fire and forget on a background thread.
    Background,
    /// Skip fsync entirely (rename ordering only).
    Off,
}

/// Caller-tunable knobs for one atomic write.
#[derive(Debug, Clone)]
pub struct WriteOptions {
    /// Explicit file mode. `None` inherits from an existing target, or
    /// falls back to [`DEFAULT_FILE_MODE`].
    pub mode: Option<u32>,
    /// Explicit `(uid, gid)`. `None` inherits from an existing target.
    pub owner: Option<(u32, u32)>,
    pub fsync: FsyncMode,
    /// Retry deadline for the whole open/write/fsync/rename chain.
    pub timeout: Duration,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            mode: None,
            owner: None,
            fsync: FsyncMode::Sync,
            timeout: DEFAULT_RETRY_TIMEOUT,
        }
    }
}

/// Write `data` to `path` atomically. The target either keeps its old
/// content or holds exactly `data`; no interleaving is observable even
/// with concurrent callers, because writes to one logical path are
/// serialized through the context's FIFO queue.
pub fn write_file_atomic(
    ctx: &DurabilityContext,
    path: &Path,
    data: &[u8],
    opts: &WriteOptions,
) -> Result<()> {
    // Follow symlinks so temp and target share a directory; a rename
    // across filesystems would not be atomic.
    let target = resolve_target(path);
    let _ticket = ctx.acquire_path(&target);

    let temp = target.with_file_name(temp_basename(&basename(&target)));
    ctx.register_temp(temp.clone());

    let policy = RetryPolicy::transient(opts.timeout);
    let outcome = write_pending(ctx, &target, &temp, data, opts, &policy);
    if outcome.is_err() {
        // Best-effort cleanup; the original error is what matters.
        let _ = fs::remove_file(&temp);
    }
    ctx.purge_temp(&temp);
    outcome?;
    tracing::debug!(path = %target.display(), bytes = data.len(), "atomic write committed");
    Ok(())
}

/// Read the raw bytes at `path`, retrying transient errors. Returns
/// `None` when the file does not exist (fresh store).
pub fn read_file(
    ctx: &DurabilityContext,
    path: &Path,
    timeout: Duration,
) -> Result<Option<Vec<u8>>> {
    let target = resolve_target(path);
    let _ticket = ctx.acquire_path(&target);
    let _permit = ctx.acquire_descriptor();
    let policy = RetryPolicy::transient(timeout);
    match with_retry(&policy, || fs::read(&target)) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn write_pending(
    ctx: &DurabilityContext,
    target: &Path,
    temp: &Path,
    data: &[u8],
    opts: &WriteOptions,
    policy: &RetryPolicy,
) -> io::Result<()> {
    let (mode, owner) = effective_metadata(target, opts)?;

    if let Some(parent) = temp.parent() {
        create_dirs(parent)?;
    }

    // Hold the descriptor slot for the whole open..close window.
    let _permit = ctx.acquire_descriptor();
    let mut file = with_retry(policy, || open_temp(temp, mode))?;

    with_retry(policy, || {
        // A retried attempt starts from a clean file, not appended bytes.
        file.seek(SeekFrom::Start(0))?;
        file.set_len(0)?;
        file.write_all(data)
    })?;

    match opts.fsync {
        FsyncMode::Sync => with_retry(policy, || file.sync_all())?,
        FsyncMode::Background => {
            let clone = file.try_clone()?;
            thread::spawn(move || {
                if let Err(err) = clone.sync_all() {
                    tracing::warn!(error = %err, "background fsync failed");
                }
            });
        }
        FsyncMode::Off => {}
    }
    drop(file);

    apply_metadata(temp, mode, owner)?;

    if let Err(err) = with_retry(policy, || fs::rename(temp, target)) {
        if !is_name_too_long(&err) {
            return Err(err);
        }
        // One retry with a basename cut down to the same limit the temp
        // naming rule uses.
        let truncated =
            target.with_file_name(truncate_basename(&basename(target), LIMIT_BASENAME_LENGTH));
        tracing::warn!(path = %target.display(), fallback = %truncated.display(), "rename hit name-too-long, retrying truncated");
        with_retry(policy, || fs::rename(temp, &truncated))?;
    }
    Ok(())
}

/// Canonical target path: follow symlinks when the file exists, otherwise
/// the logical path is canonical.
fn resolve_target(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// `<basename>.tmp-<10-digit-epoch><6-hex-random>`, truncated to
/// [`LIMIT_BASENAME_LENGTH`].
fn temp_basename(base: &str) -> String {
    let epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let mut random = [0u8; TEMP_RANDOM_LEN / 2];
    rand::thread_rng().fill_bytes(&mut random);
    let name = format!("{base}{TEMP_MARKER}{epoch:010}{}", hex::encode(random));
    truncate_basename(&name, LIMIT_BASENAME_LENGTH)
}

/// Deterministically cut a basename down to `limit` bytes, preserving the
/// extension and any temp suffix. Names already within the limit are
/// returned untouched.
fn truncate_basename(name: &str, limit: usize) -> String {
    if name.len() <= limit {
        return name.to_owned();
    }
    let (body, temp_suffix) = match name.rfind(TEMP_MARKER) {
        Some(idx) => name.split_at(idx),
        None => (name, ""),
    };
    let (stem, ext) = match body.rfind('.') {
        Some(idx) if idx > 0 => body.split_at(idx),
        _ => (body, ""),
    };
    let keep = limit.saturating_sub(ext.len() + temp_suffix.len());
    let mut truncated = String::with_capacity(limit);
    for ch in stem.chars() {
        if truncated.len() + ch.len_utf8() > keep {
            break;
        }
        truncated.push(ch);
    }
    truncated.push_str(ext);
    truncated.push_str(temp_suffix);
    truncated
}

fn open_temp(temp: &Path, mode: u32) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    options.open(temp)
}

fn create_dirs(parent: &Path) -> io::Result<()> {
    if parent.as_os_str().is_empty() || parent.is_dir() {
        return Ok(());
    }
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(DEFAULT_DIR_MODE);
    }
    builder.create(parent)
}

/// Mode and ownership to stamp on the temp file: explicit options win,
/// then whatever the existing target carries, then the defaults.
fn effective_metadata(
    target: &Path,
    opts: &WriteOptions,
) -> io::Result<(u32, Option<(u32, u32)>)> {
    if let (Some(mode), owner @ Some(_)) = (opts.mode, opts.owner) {
        return Ok((mode, owner));
    }
    let existing = match fs::metadata(target) {
        Ok(meta) => Some(meta),
        Err(err) if err.kind() == io::ErrorKind::NotFound => None,
        Err(err) => return Err(err),
    };
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        let mode = opts.mode.unwrap_or_else(|| {
            existing
                .as_ref()
                .map_or(DEFAULT_FILE_MODE, |meta| meta.mode() & 0o777)
        });
        let owner = opts
            .owner
            .or_else(|| existing.as_ref().map(|meta| (meta.uid(), meta.gid())));
        Ok((mode, owner))
    }
    #[cfg(not(unix))]
    {
        let _ = existing;
        Ok((opts.mode.unwrap_or(DEFAULT_FILE_MODE), opts.owner))
    }
}

fn apply_metadata(temp: &Path, mode: u32, owner: Option<(u32, u32)>) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        use crate::retry::metadata_change_acceptable;
        if let Err(err) = fs::set_permissions(temp, fs::Permissions::from_mode(mode)) {
            if !metadata_change_acceptable(&err) {
                return Err(err);
            }
            tracing::debug!(error = %err, "chmod not supported here, continuing");
        }
        if let Some((uid, gid)) = owner {
            if let Err(err) = std::os::unix::fs::chown(temp, Some(uid), Some(gid)) {
                if !metadata_change_acceptable(&err) {
                    return Err(err);
                }
                tracing::debug!(error = %err, "chown not supported here, continuing");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (temp, mode, owner);
    }
    Ok(())
}

fn is_name_too_long(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(libc::ENAMETOOLONG)
    }
    #[cfg(not(unix))]
    {
        let _ = err;
        false
    }
}
