use crate::error::*;
use regex::Regex;
use std::fmt;

/// Fully qualified image reference, `[host[:port]/]owner/name:tag`
///
/// Parsing fills in what `docker pull` would assume: a bare name lives in
/// `library/`, and a missing tag means `latest`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageName {
    /// Registry host including the port, `None` for Docker Hub
    pub host: Option<String>,
    /// Repository path, e.g. `lsstsqre/sciplat-lab`
    pub repository: String,
    pub tag: String,
}

lazy_static::lazy_static! {
    static ref REPOSITORY_RE: Regex = Regex::new(r"^[a-z0-9]+((\.|_|__|-+)[a-z0-9]+)*(/[a-z0-9]+((\.|_|__|-+)[a-z0-9]+)*)*$").unwrap();
    static ref TAG_RE: Regex = Regex::new(r"^[a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}$").unwrap();
}

impl ImageName {
    pub fn parse(input: &str) -> Result<Self> {
        let err = || Error::InvalidImageName(input.to_string());
        let input = input.trim();
        let (host, rest) = match input.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (Some(first.to_string()), rest)
            }
            _ => (None, input),
        };
        let (repository, tag) = match rest.rsplit_once(':') {
            Some((repository, tag)) => (repository, tag),
            None => (rest, "latest"),
        };
        let repository = if repository.contains('/') {
            repository.to_string()
        } else {
            format!("library/{}", repository)
        };
        if !REPOSITORY_RE.is_match(&repository) || !TAG_RE.is_match(tag) {
            return Err(err());
        }
        Ok(ImageName {
            host,
            repository,
            tag: tag.to_string(),
        })
    }

    /// Name fragment usable inside a Kubernetes object name
    ///
    /// The last two repository components and the tag, joined with hyphens.
    pub fn pod_component(&self) -> String {
        let parts: Vec<&str> = self.repository.split('/').collect();
        let tail = &parts[parts.len().saturating_sub(2)..];
        format!("{}-{}", tail.join("-"), self.tag)
            .to_lowercase()
            .replace([':', '_', '.'], "-")
    }
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(host) = &self.host {
            write!(f, "{}/", host)?;
        }
        write!(f, "{}:{}", self.repository, self.tag)
    }
}
