//! Ctfile name grammar: `YYYYMMDD-HHMMSS-<user>`, verified and pattern
//! matched the same way for both delete's "all files" selection and cull's
//! retention sweep.

use std::sync::LazyLock;

use base64::Engine as _;
use regex::Regex;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::error::{CtEngineError, CtResult};

const DATE_TIME_PREFIX_FORMAT: &[time::format_description::FormatItem<'static>] =
    format_description!("[year][month][day]-[hour][minute][second]");

/// Characters disallowed in the user-supplied portion of a ctfile name: the
/// path separator and the glob/shell metacharacters that would make a
/// derived name ambiguous on a filesystem or as a delete match pattern.
pub const REJECT_CHARS: &[char] = &['/', '\\', '*', '?', '[', ']', '\0'];

/// Base64-encoded form of a ctfile name may not exceed this length. Chosen to
/// match the maximum remote path component this engine's transport accepts
/// (255 raw bytes comfortably exceeds any real manifest name; the limit
/// exists to bound a pathological caller, not ordinary use).
pub const MAX_BASE64_LEN: usize = 255;

/// Matches any syntactically well-formed ctfile name: an 8-digit date, a
/// 6-digit time, a dash, and the free-form user portion. Shared by delete
/// (to select `all_files`) and cull (to enumerate every known ctfile before
/// resolving retention).
pub static ALL_CTFILES_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]{8}-[0-9]{6}-.*$").expect("pattern is valid"));

/// Splits a well-formed ctfile name into its `YYYYMMDD-HHMMSS` date-time
/// prefix and the remaining user portion, or `None` if `name` does not match
/// [`ALL_CTFILES_PATTERN`].
#[must_use]
pub fn split_prefix(name: &str) -> Option<(&str, &str)> {
    if !ALL_CTFILES_PATTERN.is_match(name) {
        return None;
    }
    // "YYYYMMDD-HHMMSS" is exactly 15 bytes, followed by '-' and the rest.
    if name.len() < 16 {
        return None;
    }
    Some((&name[..15], &name[16..]))
}

/// Verifies a ctfile name against the wire grammar: the user portion must
/// avoid [`REJECT_CHARS`], and the full `YYYYMMDD-HHMMSS-<user>` form must
/// base64-encode within [`MAX_BASE64_LEN`].
///
/// # Errors
///
/// Returns [`CtEngineError::InvalidCtfileName`] if either rule fails.
pub fn verify(name: &str) -> CtResult<()> {
    let Some((_, user_portion)) = split_prefix(name) else {
        return Err(CtEngineError::InvalidCtfileName(format!(
            "{name} does not match YYYYMMDD-HHMMSS-<user>"
        )));
    };

    if let Some(bad) = user_portion.chars().find(|c| REJECT_CHARS.contains(c)) {
        return Err(CtEngineError::InvalidCtfileName(format!(
            "{name} contains rejected character {bad:?}"
        )));
    }

    let encoded = base64::engine::general_purpose::STANDARD.encode(name.as_bytes());
    if encoded.len() > MAX_BASE64_LEN {
        return Err(CtEngineError::InvalidCtfileName(format!(
            "{name} base64-encodes to {} bytes, exceeds {MAX_BASE64_LEN}",
            encoded.len()
        )));
    }

    Ok(())
}

/// Formats the current UTC time as the `YYYYMMDD-HHMMSS` prefix stamped onto
/// a derived remote name when the caller supplies none of their own.
#[must_use]
pub fn current_date_time_prefix() -> String {
    OffsetDateTime::now_utc()
        .format(DATE_TIME_PREFIX_FORMAT)
        .expect("static format description is valid")
}

/// Formats the `YYYYMMDD-HHMMSS` prefix `keep_days` before now, for
/// lexicographic comparison against ctfile name prefixes during cull
/// retention.
#[must_use]
pub fn cutoff_prefix(keep_days: u32) -> String {
    let cutoff = OffsetDateTime::now_utc() - time::Duration::days(i64::from(keep_days));
    cutoff
        .format(DATE_TIME_PREFIX_FORMAT)
        .expect("static format description is valid")
}

/// Derives a remote name from a local file name by stamping the current
/// date-time prefix ahead of the local name's base (non-directory) portion.
///
/// # Errors
///
/// Returns [`CtEngineError::InvalidCtfileName`] if the derived name fails
/// [`verify`].
pub fn derive_remote_name(local_name: &str, date_time_prefix: &str) -> CtResult<String> {
    let base = local_name
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(local_name);
    let derived = format!("{date_time_prefix}-{base}");
    verify(&derived)?;
    Ok(derived)
}
