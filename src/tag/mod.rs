//! Tag records, the naming grammar, and human readable descriptions

mod sort;

pub use sort::{sort_by_field, sort_by_name, version_key};

use crate::Digest;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One registry tag as seen by a scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagRecord {
    pub name: String,
    /// Registry-assigned identifier, opaque
    pub id: u64,
    pub size: u64,
    #[serde(rename = "updated")]
    pub last_updated: DateTime<Utc>,
    #[serde(rename = "hash")]
    pub manifest_digest: Option<Digest>,
    pub description: String,
}

impl TagRecord {
    pub fn new(name: &str, id: u64, size: u64, last_updated: DateTime<Utc>) -> Self {
        TagRecord {
            name: name.to_string(),
            id,
            size,
            last_updated,
            manifest_digest: None,
            description: describe(name),
        }
    }

    pub fn bucket(&self) -> Bucket {
        classify(&self.name)
    }
}

/// Classification of a tag by its naming convention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    Recommended,
    Latest,
    Experimental,
    Daily,
    Weekly,
    Release,
    Other,
}

impl Bucket {
    pub const ALL: [Bucket; 7] = [
        Bucket::Recommended,
        Bucket::Latest,
        Bucket::Experimental,
        Bucket::Daily,
        Bucket::Weekly,
        Bucket::Release,
        Bucket::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::Recommended => "recommended",
            Bucket::Latest => "latest",
            Bucket::Experimental => "experimental",
            Bucket::Daily => "daily",
            Bucket::Weekly => "weekly",
            Bucket::Release => "release",
            Bucket::Other => "other",
        }
    }

    /// `recommended*` and `latest*` tags only name other tags
    pub fn is_alias(&self) -> bool {
        matches!(self, Bucket::Recommended | Bucket::Latest)
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

lazy_static::lazy_static! {
    static ref RELEASE_RE: Regex = Regex::new(r"^r\d").unwrap();
    static ref WEEKLY_RE: Regex = Regex::new(r"^w_?\d").unwrap();
    static ref DAILY_RE: Regex = Regex::new(r"^d_?\d").unwrap();
    static ref EXPERIMENTAL_RE: Regex = Regex::new(r"^(exp|e\d)").unwrap();
    static ref TRAILING_DIGITS_RE: Regex = Regex::new(r"\d+$").unwrap();
}

/// Bucket of a tag name. The first matching rule wins:
///
/// 1. `recommended*`, `latest*`
/// 2. `r<digits>...`
/// 3. `w_<year>_<week>`, `w<digits>...`
/// 4. `d_<year>_<month>_<day>`, `d<digits>...`
/// 5. `exp...`, `e<digits>...`
/// 6. anything else
pub fn classify(tag: &str) -> Bucket {
    if tag.starts_with("recommended") {
        Bucket::Recommended
    } else if tag.starts_with("latest") {
        Bucket::Latest
    } else if RELEASE_RE.is_match(tag) {
        Bucket::Release
    } else if WEEKLY_RE.is_match(tag) {
        Bucket::Weekly
    } else if DAILY_RE.is_match(tag) {
        Bucket::Daily
    } else if EXPERIMENTAL_RE.is_match(tag) {
        Bucket::Experimental
    } else {
        Bucket::Other
    }
}

/// Underscore-delimited tags of the current naming scheme
pub fn is_new_style(tag: &str) -> bool {
    tag.contains('_') && !tag.starts_with("latest_")
}

/// Split a new-style tag into components, with a major number glued to the
/// type letter (`r17_0_1`) moved into its own component.
pub(crate) fn components(tag: &str) -> Vec<&str> {
    let mut components: Vec<&str> = tag.split('_').collect();
    if let Some(m) = TRAILING_DIGITS_RE.find(components[0]) {
        components.insert(1, m.as_str());
    }
    components
}

/// Human readable description of a tag
///
/// Alias tags are only capitalized here; see [describe_with] to include the
/// tag they resolve to.
pub fn describe(tag: &str) -> String {
    describe_with(tag, |_| None)
}

/// Human readable description, resolving alias tags with `resolve`
pub fn describe_with<F>(tag: &str, resolve: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let bucket = classify(tag);
    if bucket.is_alias() {
        let mut desc = capitalize(tag);
        if let Some(target) = resolve(tag) {
            desc.push_str(&format!(" ({})", describe(&target)));
        }
        return desc;
    }
    let desc = if tag.contains('_') {
        describe_new_style(bucket, tag)
    } else {
        describe_old_style(bucket, tag)
    };
    desc.unwrap_or_else(|| tag.to_string())
}

fn describe_new_style(bucket: Bucket, tag: &str) -> Option<String> {
    let c = components(tag);
    match bucket {
        Bucket::Release => {
            let major = c.get(1).map(|s| trim_number(s))?;
            let minor = c.get(2)?;
            let mut desc = format!("Release {}.{}", major, minor);
            if let Some(patch) = c.get(3).filter(|p| !p.is_empty()) {
                desc.push('.');
                desc.push_str(patch);
            }
            if c.len() > 4 {
                desc.push('-');
                desc.push_str(&c[4..].join("_"));
            }
            Some(desc)
        }
        Bucket::Weekly => Some(format!("Weekly {}_{}", c.get(1)?, c.get(2)?)),
        Bucket::Daily => Some(format!(
            "Daily {}_{}_{}",
            c.get(1)?,
            c.get(2)?,
            c.get(3)?
        )),
        Bucket::Experimental if c[0] == "exp" => {
            Some(format!("Experimental {}", c[1..].join("_")))
        }
        _ => None,
    }
}

fn describe_old_style(bucket: Bucket, tag: &str) -> Option<String> {
    match bucket {
        Bucket::Release => Some(format!("Release {}.{}", tag.get(1..3)?, tag.get(3..)?)),
        Bucket::Weekly => Some(format!("Weekly {}_{}", tag.get(1..5)?, tag.get(5..)?)),
        Bucket::Daily => Some(format!(
            "Daily {}_{}_{}",
            tag.get(1..5)?,
            tag.get(5..7)?,
            tag.get(7..)?
        )),
        Bucket::Experimental => Some(format!("Experimental {}", tag.get(1..)?)),
        _ => None,
    }
}

/// `017` and `17` are the same major number
fn trim_number(s: &str) -> String {
    match s.parse::<u64>() {
        Ok(n) => n.to_string(),
        Err(_) => s.to_string(),
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
