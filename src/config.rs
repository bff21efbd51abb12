//! Configuration of the scanner and the prepuller
//!
//! Every tunable is enumerated here and passed down at construction.
//! Nothing in the core reads the process environment.

use crate::error::*;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{fs, path::*, str::FromStr, time::Duration};

pub const PROJECT_NAME: &str = "labpuller";

/// Project root data directory
pub fn data_dir() -> Result<PathBuf> {
    let p = ProjectDirs::from("", PROJECT_NAME, PROJECT_NAME).ok_or(Error::NoValidHomeDirectory)?;
    Ok(p.data_dir().to_owned())
}

/// Default location of the manifest digest cache
pub fn default_cache_file() -> Result<PathBuf> {
    Ok(data_dir()?.join("repo-cache.json"))
}

/// Field used to order tags within a bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortField {
    /// Semantic-version aware ordering of tag names
    Name,
    Id,
    Size,
    Updated,
}

impl Default for SortField {
    fn default() -> Self {
        SortField::Name
    }
}

impl FromStr for SortField {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "name" => Ok(SortField::Name),
            "id" => Ok(SortField::Id),
            "size" => Ok(SortField::Size),
            "updated" | "last_updated" => Ok(SortField::Updated),
            _ => Err(Error::InvalidSortField(s.to_string())),
        }
    }
}

/// Which repository to scan, and how many tags of each kind to keep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub host: String,
    /// Tag listing path. Derived from owner and name when empty.
    pub path: String,
    pub owner: String,
    pub name: String,
    pub port: Option<u16>,
    /// Use plain http
    pub insecure: bool,
    pub experimentals: usize,
    pub dailies: usize,
    pub weeklies: usize,
    pub releases: usize,
    pub recommended: bool,
    pub sort_field: SortField,
    pub cache_file: Option<PathBuf>,
    /// Credentials presented to the token realm of private registries
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        ScanConfig {
            host: "hub.docker.com".to_string(),
            path: String::new(),
            owner: "lsstsqre".to_string(),
            name: "sciplat-lab".to_string(),
            port: None,
            insecure: false,
            experimentals: 0,
            dailies: 3,
            weeklies: 2,
            releases: 1,
            recommended: true,
            sort_field: SortField::Name,
            cache_file: None,
            username: None,
            password: None,
        }
    }
}

impl ScanConfig {
    fn scheme(&self) -> &'static str {
        if self.insecure {
            "http"
        } else {
            "https"
        }
    }

    fn with_port(&self, host: &str) -> String {
        match self.port {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    /// Path of the paginated tag listing endpoint
    pub fn tags_path(&self) -> String {
        if self.path.is_empty() {
            format!("/v2/repositories/{}/{}/tags/", self.owner, self.name)
        } else {
            self.path.clone()
        }
    }

    /// URL of the paginated tag listing endpoint, without the page query
    pub fn tags_url(&self) -> String {
        format!(
            "{}://{}{}",
            self.scheme(),
            self.with_port(&self.host),
            self.tags_path()
        )
    }

    /// Host serving the `/v2/` registry API
    ///
    /// Docker Hub answers the listing API and the registry API on different hosts.
    pub fn registry_host(&self) -> &str {
        if self.host == "hub.docker.com" {
            "registry.hub.docker.com"
        } else {
            &self.host
        }
    }

    /// Base URL of `/v2/<owner>/<name>/`, with trailing slash
    pub fn registry_url(&self) -> String {
        format!(
            "{}://{}/v2/{}/{}/",
            self.scheme(),
            self.with_port(self.registry_host()),
            self.owner,
            self.name
        )
    }

    /// Prefix used when images from this repository are pulled by nodes
    ///
    /// Empty for Docker Hub, `host[:port]/` otherwise.
    pub fn image_host_prefix(&self) -> String {
        if self.host == "hub.docker.com" || self.host.is_empty() {
            String::new()
        } else {
            format!("{}/", self.with_port(&self.host))
        }
    }
}

/// Label policy deciding which nodes may run Lab (or Dask) pods
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodePolicy {
    pub restrict_lab_nodes: bool,
    pub allow_dask_spawn: bool,
    pub restrict_dask_nodes: bool,
}

pub const LAB_NODE_LABEL: &str = "jupyterlab";
pub const DASK_NODE_LABEL: &str = "dask";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrepullerConfig {
    /// Namespace of the pull pods. The cluster client's own namespace when
    /// unset.
    pub namespace: Option<String>,
    /// Images to pull in addition to the ones found by scanning
    pub images: Vec<String>,
    pub command: Vec<String>,
    /// Wall-clock budget of one whole run, in seconds
    pub timeout: u64,
    /// Delay between two pod status polls, in seconds
    pub poll_interval: f64,
    pub max_tries: u32,
    pub node_policy: NodePolicy,
    /// Repository to scan for images. No scan happens without it.
    pub scan: Option<ScanConfig>,
}

impl Default for PrepullerConfig {
    fn default() -> Self {
        PrepullerConfig {
            namespace: None,
            images: Vec::new(),
            command: vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "echo Prepuller run for $(hostname) complete at $(date).".to_string(),
            ],
            timeout: 3300,
            poll_interval: 1.0,
            max_tries: 3600,
            node_policy: NodePolicy::default(),
            scan: None,
        }
    }
}

impl PrepullerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Fails for negative, infinite, NaN or unrepresentably large values
    pub fn poll_interval(&self) -> Result<Duration> {
        Duration::try_from_secs_f64(self.poll_interval)
            .map_err(|_| Error::InvalidPollInterval(self.poll_interval))
    }
}

/// Whole configuration document
///
/// ```toml
/// [scan]
/// owner = "lsstsqre"
/// name = "sciplat-lab"
/// dailies = 3
///
/// [prepuller]
/// namespace = "prepuller"
/// timeout = 3300
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scan: ScanConfig,
    pub prepuller: PrepullerConfig,
}

impl Config {
    pub fn from_toml(input: &str) -> Result<Self> {
        Ok(toml::from_str(input)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let input = fs::read_to_string(path)?;
        Self::from_toml(&input)
    }
}
