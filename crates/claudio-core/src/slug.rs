//! Branch-name-safe normalisation of free-form identifiers.
//!
//! Any user-derived segment that ends up in a branch name goes through
//! [`slug`] so names stay portable across version-control hosts.

use uuid::Uuid;

/// Maximum length of a slugged segment.
pub const MAX_SLUG_LEN: usize = 30;

/// Number of session-ID characters used in branch names.
pub const SHORT_ID_LEN: usize = 8;

/// Normalise a free-form identifier into a branch-name-safe slug.
///
/// Lowercases, collapses runs of non-alphanumeric characters to single
/// hyphens, trims leading/trailing hyphens, and truncates to
/// [`MAX_SLUG_LEN`] characters (re-trimming any trailing hyphen the cut
/// exposes). Idempotent: `slug(slug(x)) == slug(x)`.
pub fn slug(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_SLUG_LEN));
    let mut last_was_hyphen = true; // suppress leading hyphens

    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_was_hyphen = false;
        } else if !last_was_hyphen {
            out.push('-');
            last_was_hyphen = true;
        }
    }

    out.truncate(MAX_SLUG_LEN);
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// First [`SHORT_ID_LEN`] characters of a session ID, as used in branch
/// names.
pub fn short_session_id(id: &Uuid) -> String {
    let simple = id.simple().to_string();
    simple[..SHORT_ID_LEN].to_string()
}
