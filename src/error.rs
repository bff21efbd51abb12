use std::{fmt, path::PathBuf, time::Duration};

/// Error reported by the Kubernetes API, reduced to what the prepuller needs
/// to tell benign races from real failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    /// HTTP status code, when the failure came from the API server
    pub code: Option<u16>,
    pub message: String,
}

impl ApiError {
    pub fn new(code: Option<u16>, message: impl Into<String>) -> Self {
        ApiError {
            code,
            message: message.into(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.code == Some(409)
    }

    pub fn is_not_found(&self) -> bool {
        self.code == Some(404)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (HTTP {})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<kube::Error> for ApiError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(res) => ApiError::new(Some(res.code), res.message),
            e => ApiError::new(None, e.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    //
    // Invalid user input
    //
    #[error("Invalid digest: {0}")]
    InvalidDigest(String),
    #[error("Invalid image name: {0}")]
    InvalidImageName(String),
    #[error("Unknown sort field: {0}")]
    InvalidSortField(String),
    #[error("Invalid poll interval: {0} seconds")]
    InvalidPollInterval(f64),
    #[error(transparent)]
    InvalidUrl(#[from] url::ParseError),
    #[error(transparent)]
    InvalidJson(#[from] serde_json::error::Error),
    #[error(transparent)]
    InvalidToml(#[from] toml::de::Error),

    //
    // Error from container registry
    //
    #[error("Failure retrieving {url}: {reason}{}", .body.as_ref().map(|b| format!(" [ data: {} ]", b)).unwrap_or_default())]
    Retrieval {
        url: String,
        reason: String,
        body: Option<String>,
    },
    #[error("Could not fetch manifest for tag '{tag}': {reason}")]
    ManifestFetch { tag: String, reason: String },
    #[error("Authorization failed: {0}")]
    AuthorizationFailed(String),
    #[error("Unsupported WWW-Authentication header: {0}")]
    UnSupportedAuthHeader(String),
    #[error("Network error: {0}")]
    NetworkError(String),

    //
    // Manifest cache
    //
    #[error("Failed to load cachefile '{}': {reason}", .path.display())]
    CacheLoad { path: PathBuf, reason: String },
    #[error("Could not write to {}: {reason}", .path.display())]
    CacheWrite { path: PathBuf, reason: String },

    //
    // Scan results
    //
    #[error("Scan results did not become available in {0:?}")]
    ScanNotReady(Duration),

    //
    // Error from Kubernetes
    //
    #[error("Cannot {operation} pod '{pod}' in namespace '{namespace}': {source}")]
    PodLifecycle {
        operation: &'static str,
        pod: String,
        namespace: String,
        source: ApiError,
    },
    #[error("Cannot list {resource}: {source}")]
    ClusterQuery {
        resource: &'static str,
        source: ApiError,
    },
    #[error("Pod '{pod}' did not complete after {tries} {delay:?} iterations")]
    PollExhausted {
        pod: String,
        tries: u32,
        delay: Duration,
    },
    #[error("Did not complete in {0:?}")]
    PrepullTimeout(Duration),
    #[error("Prepull failed on node(s): {}", .0.join(", "))]
    NodeFailures(Vec<String>),
    #[error("Prepull was cancelled")]
    Cancelled,

    //
    // System error
    //
    #[error("No valid home directory path could be retrieved from the operating system")]
    NoValidHomeDirectory,
    #[error(transparent)]
    UnknownIo(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<ureq::Transport> for Error {
    fn from(e: ureq::Transport) -> Self {
        Error::NetworkError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retrieval_message_carries_body() {
        let e = Error::Retrieval {
            url: "https://hub.docker.com/v2/repositories/a/b/tags/?page=2".to_string(),
            reason: "HTTP 502".to_string(),
            body: Some("bad gateway".to_string()),
        };
        let msg = e.to_string();
        assert!(msg.contains("page=2"));
        assert!(msg.contains("[ data: bad gateway ]"));

        let e = Error::Retrieval {
            url: "u".to_string(),
            reason: "r".to_string(),
            body: None,
        };
        assert_eq!(e.to_string(), "Failure retrieving u: r");
    }

    #[test]
    fn api_error_codes() {
        assert!(ApiError::new(Some(409), "exists").is_conflict());
        assert!(ApiError::new(Some(404), "gone").is_not_found());
        assert!(!ApiError::new(None, "io").is_not_found());
        assert_eq!(ApiError::new(Some(500), "boom").to_string(), "boom (HTTP 500)");
    }
}
