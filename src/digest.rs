use crate::error::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;

/// Content fingerprint of an image
///
/// Either the `Docker-Content-Digest` reported by the registry, in the form
///
/// ```text
/// digest                ::= algorithm ":" encoded
/// encoded               ::= [a-zA-Z0-9=_-]+
/// ```
///
/// or a SHA-256 over the layer blob sums of the manifest, which carries no
/// algorithm prefix. Two tags are byte-identical when their digests are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(String);

lazy_static::lazy_static! {
    static ref DIGEST_RE: Regex = Regex::new(r"^([a-z0-9]+([+._-][a-z0-9]+)*:)?[a-zA-Z0-9=_-]+$").unwrap();
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Digest {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Digest, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Digest::new(&s).map_err(serde::de::Error::custom)
    }
}

impl Digest {
    pub fn new(input: &str) -> Result<Self> {
        let input = input.trim();
        if DIGEST_RE.is_match(input) {
            Ok(Digest(input.to_string()))
        } else {
            Err(Error::InvalidDigest(input.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hash of the layer blob sums joined by `+`, hex encoded
    pub fn from_layers<S: AsRef<str>>(layers: &[S]) -> Self {
        let joined = layers
            .iter()
            .map(|l| l.as_ref())
            .collect::<Vec<_>>()
            .join("+");
        let hash = Sha256::digest(joined.as_bytes());
        Digest(base16ct::lower::encode_string(&hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_hash() {
        // sha256("a+b")
        let d = Digest::from_layers(&["a", "b"]);
        assert_eq!(
            d.as_str(),
            "300273daf0bb57c239f83585d71ced54ce6b3b5fb81615abbeeb3f9cf5fae92f"
        );
        assert_eq!(d, Digest::from_layers(&["a".to_string(), "b".to_string()]));
        assert_ne!(d, Digest::from_layers(&["b", "a"]));
    }

    #[test]
    fn parse() {
        assert!(Digest::new("sha256:0123abcd").is_ok());
        assert!(Digest::new("0123abcd").is_ok());
        assert!(Digest::new("sha256:").is_err());
        assert!(Digest::new("not a digest").is_err());
    }
}
