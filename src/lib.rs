//! labpuller
//! ==========
//!
//! Scans a container registry for JupyterLab image tags and prepulls the
//! selected images on every node of a Kubernetes cluster.
//!
//! - [scan::ScanRepo] lists the tags of one repository, keeps their manifest
//!   digests in a cache file, and selects recommended, experimental, daily,
//!   weekly and release images.
//! - [prepull::Prepuller] runs one pull pod per (node, image) pair.
//!
//! Both take their transports, [registry::HttpClient] and
//! [prepull::ClusterApi], at construction.

pub mod config;
pub mod error;
pub mod prepull;
pub mod registry;
pub mod scan;
pub mod tag;

mod digest;
mod image_name;

pub use digest::Digest;
pub use image_name::ImageName;
pub use prepull::{prepull, Prepuller};
pub use scan::{scan, ScanRepo, ScanResult};
