//! Ordering of tags within a bucket
//!
//! New-style (underscore) tags are ordered as semantic versions, newest
//! first, and always precede old-style tags, which are ordered by name.

use super::{classify, components, is_new_style, Bucket, TagRecord};
use crate::config::SortField;
use semver::{BuildMetadata, Prerelease, Version};
use std::cmp::{Ordering, Reverse};

/// Semantic version of a new-style tag
///
/// `{type}{major}_{minor}_{patch}_{prerelease}_{build...}`, where a
/// non-numeric patch becomes the prerelease label and the patch stays 0.
/// Returns `None` for old-style tags.
pub fn version_key(tag: &str) -> Option<Version> {
    if !is_new_style(tag) {
        return None;
    }
    let mut c = components(tag);
    // The type prefix carries no version meaning, `exp` wraps another type
    if c[0] == "exp" {
        c.remove(0);
    }

    let mut pre: Vec<&str> = Vec::new();
    let mut numbers = [0u64; 3];
    for (i, n) in numbers.iter_mut().enumerate() {
        if let Some(s) = c.get(i + 1) {
            match s.parse() {
                Ok(v) => *n = v,
                Err(_) => pre.push(*s),
            }
        }
    }
    if let Some(s) = c.get(4) {
        pre.push(*s);
    }
    let build = c.get(5..).map(|b| b.to_vec()).unwrap_or_default();

    let [major, minor, patch] = numbers;
    let mut version = Version::new(major, minor, patch);
    version.pre = Prerelease::new(&identifiers(&pre, true)).unwrap_or(Prerelease::EMPTY);
    version.build = BuildMetadata::new(&identifiers(&build, false)).unwrap_or(BuildMetadata::EMPTY);
    Some(version)
}

/// Dot-joined semver identifiers made of `[0-9A-Za-z-]`
fn identifiers(parts: &[&str], numeric_strict: bool) -> String {
    parts
        .iter()
        .map(|p| {
            p.chars()
                .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '-' })
                .collect::<String>()
        })
        .filter(|p| !p.is_empty())
        .map(|p| {
            // Numeric prerelease identifiers must not have leading zeros
            if numeric_strict && p.len() > 1 && p.bytes().all(|b| b.is_ascii_digit()) {
                let trimmed = p.trim_start_matches('0');
                if trimmed.is_empty() {
                    "0".to_string()
                } else {
                    trimmed.to_string()
                }
            } else {
                p
            }
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// Name used to compare old-style tags
///
/// A short release tag like `r170` has to precede its candidates `r170rc1`
/// in descending order, so it compares as if suffixed with `zzz`.
fn old_style_key(tag: &str) -> String {
    if tag.len() == 4 && classify(tag) == Bucket::Release {
        format!("{}zzz", tag)
    } else {
        tag.to_string()
    }
}

fn compare_names(a: &str, b: &str) -> Ordering {
    match (version_key(a), version_key(b)) {
        // Newest first, the name breaks ties between equal versions
        (Some(va), Some(vb)) => vb.cmp(&va).then_with(|| b.cmp(a)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => old_style_key(b)
            .cmp(&old_style_key(a))
            .then_with(|| b.cmp(a)),
    }
}

/// Sort tags by name, newest first
pub fn sort_by_name(tags: &mut [TagRecord]) {
    tags.sort_by(|a, b| compare_names(&a.name, &b.name));
}

/// Sort tags by `field`, descending
///
/// Equal values are ordered by name so that the result is reproducible.
pub fn sort_by_field(tags: &mut [TagRecord], field: SortField) {
    match field {
        SortField::Name => sort_by_name(tags),
        SortField::Id => tags.sort_by_key(|t| (Reverse(t.id), Reverse(t.name.clone()))),
        SortField::Size => tags.sort_by_key(|t| (Reverse(t.size), Reverse(t.name.clone()))),
        SortField::Updated => {
            tags.sort_by_key(|t| (Reverse(t.last_updated), Reverse(t.name.clone())))
        }
    }
}
