//! Deterministic, DNS-safe build and image name derivation.
//!
//! Build names must fit a 63-char DNS label and only need to be unique over
//! the lifetime of a build job. Image names have a 255-char budget but must
//! stay stable across registry garbage-collection windows, so they keep more
//! of the original slug. Both schemes append a slug hash so distinct slugs
//! that differ only in escaped characters cannot collide.

use sha2::{Digest, Sha256};

const BUILD_NAME_LIMIT: usize = 63;
const IMAGE_NAME_LIMIT: usize = 255;
const REF_LENGTH: usize = 6;

/// Escape every character outside `[A-Za-z0-9]` as `-` followed by the
/// lowercase hex of each of its UTF-8 bytes.
fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        if b.is_ascii_alphanumeric() {
            out.push(b as char);
        } else {
            out.push_str(&format!("-{b:02x}"));
        }
    }
    out
}

fn sha256_hex(s: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Create a unique-ish, image-safe name fragment from a provider slug.
///
/// The escaped slug is truncated to leave room for a `-` separator and
/// `hash_len` hex chars of the slug's sha256, so the result never exceeds
/// `limit` and stays distinct for slugs that escape to the same prefix.
pub fn safe_slug(slug: &str, limit: usize, hash_len: usize) -> String {
    let hash = sha256_hex(slug);
    let escaped = escape(slug);
    let keep = limit.saturating_sub(hash_len + 1);
    let head = &escaped[..escaped.len().min(keep)];
    format!("{}-{}", head, &hash[..hash_len]).to_lowercase()
}

/// Derive the ≤63-char DNS-label-safe name for a build job.
///
/// Identical `(slug, ref)` pairs always map to the same build name, which is
/// what lets concurrent submissions for the same repo coalesce downstream.
pub fn build_name(slug: &str, git_ref: &str, prefix: &str) -> String {
    let slug_limit = BUILD_NAME_LIMIT - prefix.len() - REF_LENGTH - 1;
    let safe = safe_slug(slug, slug_limit, 6);
    let safe_ref = safe_slug(git_ref, REF_LENGTH, 2);
    let short_ref = &safe_ref[..safe_ref.len().min(REF_LENGTH)];
    format!("{prefix}{safe}-{short_ref}").to_lowercase()
}

/// Derive the ≤255-char image name `{prefix}{slug}:{ref}`.
///
/// Underscores are invalid in image repository names, so the concatenated
/// name is swept for them before lowercasing.
pub fn image_name(prefix: &str, slug: &str, git_ref: &str) -> String {
    let safe = safe_slug(slug, IMAGE_NAME_LIMIT - prefix.len(), 6);
    format!("{prefix}{safe}:{git_ref}")
        .replace('_', "-")
        .to_lowercase()
}
