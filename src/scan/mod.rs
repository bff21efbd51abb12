//! Registry scanner
//!
//! [ScanRepo] lists every tag of one repository, resolves their manifest
//! digests through a [ManifestCache], and sorts them into [Bucket]s from
//! which the images offered to users are selected.

mod cache;
mod watch;

pub use cache::{CacheEntry, ManifestCache};
pub use watch::RepoWatcher;

use crate::{
    config::ScanConfig,
    error::*,
    registry::{Client, HttpClient, UreqClient},
    tag::{describe_with, sort_by_field, Bucket, TagRecord},
};
use cache::CacheStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{collections::BTreeMap, fmt::Write as _};

/// Buckets offered for selection, in display order
const SELECTION: [Bucket; 5] = [
    Bucket::Recommended,
    Bucket::Experimental,
    Bucket::Daily,
    Bucket::Weekly,
    Bucket::Release,
];

/// An image offered for selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageInfo {
    /// `<owner>/<name>:<tag>`
    pub reference: String,
    pub description: String,
}

/// Data of the image selection form
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Menu {
    pub images: Vec<ImageInfo>,
    /// `<owner>/<name>:__custom`, the entry for a free-form tag
    pub custom_tag: String,
    /// Every tag of the repository, newest first
    pub all_tags: Vec<String>,
}

/// Outcome of one scan
#[derive(Debug, Clone, PartialEq)]
pub struct ScanResult {
    repository: String,
    scanned_at: DateTime<Utc>,
    /// In registry listing order
    tags: Vec<TagRecord>,
    /// Every tag of each bucket, sorted
    buckets: BTreeMap<Bucket, Vec<TagRecord>>,
    limits: BTreeMap<Bucket, usize>,
}

impl ScanResult {
    pub fn new(config: &ScanConfig, mut tags: Vec<TagRecord>) -> Self {
        let aliases: Vec<(usize, String)> = tags
            .iter()
            .enumerate()
            .filter(|(_, t)| t.bucket().is_alias())
            .map(|(i, t)| {
                let description =
                    describe_with(&t.name, |name| resolve_in(&tags, name).map(str::to_string));
                (i, description)
            })
            .collect();
        for (i, description) in aliases {
            tags[i].description = description;
        }

        let mut buckets: BTreeMap<Bucket, Vec<TagRecord>> = BTreeMap::new();
        for tag in &tags {
            buckets.entry(tag.bucket()).or_default().push(tag.clone());
        }
        for records in buckets.values_mut() {
            sort_by_field(records, config.sort_field);
        }
        // The bare alias leads its suffixed variants
        if let Some(records) = buckets.get_mut(&Bucket::Recommended) {
            if let Some(pos) = records.iter().position(|t| t.name == "recommended") {
                records[..=pos].rotate_right(1);
            }
        }

        let limits = selection_limits(config);
        ScanResult {
            repository: format!("{}/{}", config.owner, config.name),
            scanned_at: Utc::now(),
            tags,
            buckets,
            limits,
        }
    }

    /// `<owner>/<name>`
    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn scanned_at(&self) -> DateTime<Utc> {
        self.scanned_at
    }

    /// Tags in registry listing order
    pub fn tags(&self) -> &[TagRecord] {
        &self.tags
    }

    /// Every tag of `bucket`, sorted
    pub fn bucket(&self, bucket: Bucket) -> &[TagRecord] {
        self.buckets
            .get(&bucket)
            .map(|records| records.as_slice())
            .unwrap_or_default()
    }

    /// The leading tags of `bucket` kept for selection
    pub fn selected(&self, bucket: Bucket) -> &[TagRecord] {
        let records = self.bucket(bucket);
        let limit = self.limits.get(&bucket).copied().unwrap_or(0);
        &records[..limit.min(records.len())]
    }

    /// Images for display: recommended, experimental, daily, weekly, then
    /// release selections
    pub fn extract_image_info(&self) -> Vec<ImageInfo> {
        SELECTION
            .iter()
            .flat_map(|bucket| self.selected(*bucket))
            .map(|tag| ImageInfo {
                reference: format!("{}:{}", self.repository, tag.name),
                description: tag.description.clone(),
            })
            .collect()
    }

    /// First non-alias tag with the same manifest digest as `tag`
    pub fn resolve_tag(&self, tag: &str) -> Option<&str> {
        resolve_in(&self.tags, tag)
    }

    /// Every tag, newest first
    pub fn get_all_tags(&self) -> Vec<&TagRecord> {
        let mut all: Vec<&TagRecord> = self.tags.iter().collect();
        all.sort_by(|a, b| {
            b.last_updated
                .cmp(&a.last_updated)
                .then_with(|| a.name.cmp(&b.name))
        });
        all
    }

    /// Selected tags of each bucket as pretty printed JSON
    pub fn to_json(&self) -> Result<String> {
        let report: BTreeMap<&str, &[TagRecord]> = SELECTION
            .iter()
            .map(|bucket| (bucket.as_str(), self.selected(*bucket)))
            .collect();
        Ok(serde_json::to_string_pretty(&report)?)
    }

    /// Shell snippet exporting the selected images
    ///
    /// ```text
    /// # Environment variables for Jupyter Lab containers
    /// LAB_CONTAINER_NAMES='lsstsqre/sciplat-lab:recommended,...'
    /// LAB_CONTAINER_DESCS='Recommended (Release 17.0.1),...'
    /// export LAB_CONTAINER_NAMES LAB_CONTAINER_DESCS
    /// ```
    pub fn env_report(&self) -> String {
        let images = self.extract_image_info();
        let names: Vec<&str> = images.iter().map(|i| i.reference.as_str()).collect();
        let descs: Vec<&str> = images.iter().map(|i| i.description.as_str()).collect();
        let mut out = String::new();
        // Writing to a String cannot fail
        let _ = writeln!(out, "# Environment variables for Jupyter Lab containers");
        let _ = writeln!(out, "LAB_CONTAINER_NAMES='{}'", names.join(","));
        let _ = writeln!(out, "LAB_CONTAINER_DESCS='{}'", descs.join(","));
        let _ = writeln!(out, "export LAB_CONTAINER_NAMES LAB_CONTAINER_DESCS");
        out
    }

    /// Selection form data, or `None` when there is nothing to choose from
    pub fn menu(&self) -> Option<Menu> {
        let images = self.extract_image_info();
        if images.len() < 2 {
            return None;
        }
        Some(Menu {
            images,
            custom_tag: format!("{}:__custom", self.repository),
            all_tags: self
                .get_all_tags()
                .into_iter()
                .map(|t| t.name.clone())
                .collect(),
        })
    }
}

fn selection_limits(config: &ScanConfig) -> BTreeMap<Bucket, usize> {
    let recommended = if config.recommended { 1 } else { 0 };
    [
        (Bucket::Recommended, recommended),
        (Bucket::Experimental, config.experimentals),
        (Bucket::Daily, config.dailies),
        (Bucket::Weekly, config.weeklies),
        (Bucket::Release, config.releases),
    ]
    .into_iter()
    .collect()
}

fn resolve_in<'a>(tags: &'a [TagRecord], tag: &str) -> Option<&'a str> {
    let digest = tags
        .iter()
        .find(|t| t.name == tag)?
        .manifest_digest
        .as_ref()?;
    tags.iter()
        .filter(|t| t.name != tag && !t.bucket().is_alias())
        .find(|t| t.manifest_digest.as_ref() == Some(digest))
        .map(|t| t.name.as_str())
}

/// Scanner of one repository
///
/// The cache file named by [ScanConfig::cache_file] is read at construction
/// and rewritten after every scan. Without one the cache lives in memory.
pub struct ScanRepo<H = UreqClient> {
    config: ScanConfig,
    client: Client<H>,
    store: CacheStore,
    result: Option<ScanResult>,
}

impl<H: HttpClient> ScanRepo<H> {
    pub fn new(config: ScanConfig, http: H) -> Self {
        let client = Client::new(http, &config);
        let store = CacheStore::open(config.cache_file.clone());
        ScanRepo {
            config,
            client,
            store,
            result: None,
        }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn cache(&self) -> &ManifestCache {
        &self.store.cache
    }

    /// List every tag, refresh stale digests, and classify
    ///
    /// Failing to list tags is an error. A tag whose manifest cannot be
    /// fetched keeps no digest and the scan goes on.
    pub fn scan(&mut self) -> Result<&ScanResult> {
        log::debug!("Beginning repo scan of '{}'", self.client.tags_url());
        let mut tags = self.client.get_tags()?;

        let mut fetched = 0;
        for tag in tags.iter_mut() {
            if let Some(digest) = self.store.cache.fresh(&tag.name, tag.last_updated) {
                tag.manifest_digest = Some(digest.clone());
                continue;
            }
            match self.client.get_digest(&tag.name) {
                Ok(Some(digest)) => {
                    self.store
                        .cache
                        .insert(&tag.name, tag.last_updated, digest.clone());
                    tag.manifest_digest = Some(digest);
                    fetched += 1;
                }
                Ok(None) => log::warn!("Manifest of tag '{}' lists no layers", tag.name),
                Err(e) => log::warn!("{}", e),
            }
        }
        if fetched == 0 {
            log::debug!("All images have current hash");
        } else {
            log::info!("Fetched {} manifest digests", fetched);
        }
        self.store.persist();

        let result = ScanResult::new(&self.config, tags);
        Ok(&*self.result.insert(result))
    }

    /// Result of the last successful scan
    pub fn result(&self) -> Option<&ScanResult> {
        self.result.as_ref()
    }

    /// See [ScanResult::extract_image_info]. Empty before the first scan.
    pub fn extract_image_info(&self) -> Vec<ImageInfo> {
        self.result
            .as_ref()
            .map(ScanResult::extract_image_info)
            .unwrap_or_default()
    }

    pub fn resolve_tag(&self, tag: &str) -> Option<&str> {
        self.result.as_ref()?.resolve_tag(tag)
    }

    pub fn get_all_tags(&self) -> Vec<&TagRecord> {
        self.result
            .as_ref()
            .map(ScanResult::get_all_tags)
            .unwrap_or_default()
    }
}

/// Scan a repository once
pub fn scan<H: HttpClient>(config: ScanConfig, http: H) -> Result<ScanResult> {
    let mut repo = ScanRepo::new(config, http);
    Ok(repo.scan()?.clone())
}
