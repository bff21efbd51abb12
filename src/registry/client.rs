use super::{
    auth::{AuthChallenge, Credentials},
    http::{with_query, HttpClient, HttpResponse},
};
use crate::{config::ScanConfig, error::*, tag::TagRecord, Digest};
use chrono::{DateTime, Utc};
use serde::Deserialize;

const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
application/vnd.docker.distribution.manifest.list.v2+json, \
application/vnd.oci.image.manifest.v1+json, \
application/vnd.oci.image.index.v1+json, \
application/json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Get,
    Head,
}

/// A client for the tag listing API and the `/v2/<owner>/<name>/` registry API
pub struct Client<H> {
    http: H,
    /// Paginated tag listing endpoint
    tags_url: String,
    /// Base of the registry API, with trailing slash
    registry_url: String,
    credentials: Option<Credentials>,
    /// Cached bearer token
    token: Option<String>,
}

impl<H: HttpClient> Client<H> {
    pub fn new(http: H, config: &ScanConfig) -> Self {
        let credentials = match (&config.username, &config.password) {
            (Some(username), Some(password)) => Some(Credentials::new(username, password)),
            _ => None,
        };
        Client {
            http,
            tags_url: config.tags_url(),
            registry_url: config.registry_url(),
            credentials,
            token: None,
        }
    }

    pub fn tags_url(&self) -> &str {
        &self.tags_url
    }

    /// Get every tag of the repository, following pages until `next` is empty
    ///
    /// ```text
    /// GET <path>?page=<n>
    /// ```
    pub fn get_tags(&self) -> Result<Vec<TagRecord>> {
        let mut results = Vec::new();
        let mut page = 1u32;
        loop {
            let url = with_query(&self.tags_url, &[("page", &page.to_string())])?;
            let res = self
                .http
                .get(&url, &[("Accept", "application/json")])
                .map_err(|e| Error::Retrieval {
                    url: url.clone(),
                    reason: e.to_string(),
                    body: None,
                })?;
            if !res.is_success() {
                return Err(Error::Retrieval {
                    url,
                    reason: format!("HTTP {}", res.status),
                    body: Some(res.text()).filter(|b| !b.is_empty()),
                });
            }
            let tag_page: TagPage = res.json().map_err(|e| Error::Retrieval {
                url: url.clone(),
                reason: format!("Could not decode as JSON: {}", e),
                body: Some(res.text()),
            })?;
            results.extend(tag_page.results.into_iter().map(RawTag::into_record));
            match tag_page.next {
                Some(next) if !next.is_empty() => page += 1,
                _ => break,
            }
        }
        log::debug!("Retrieved {} tags from '{}'", results.len(), self.tags_url);
        Ok(results)
    }

    /// Get the content digest of a tag
    ///
    /// Tries `HEAD` first and takes the `Docker-Content-Digest` header. Falls
    /// back to `GET` and hashes the layer blob sums when the registry does not
    /// report a digest. Returns `None` when the manifest lists no layers.
    ///
    /// ```text
    /// HEAD /v2/<owner>/<name>/manifests/<tag>
    /// GET  /v2/<owner>/<name>/manifests/<tag>
    /// ```
    pub fn get_digest(&mut self, tag: &str) -> Result<Option<Digest>> {
        let url = format!("{}manifests/{}", self.registry_url, tag);
        let fetch_err = |reason: String| Error::ManifestFetch {
            tag: tag.to_string(),
            reason,
        };

        let res = self.call(Method::Head, &url)?;
        if res.is_success() {
            if let Some(digest) = digest_header(&res) {
                return Ok(Some(digest));
            }
        }

        let res = self.call(Method::Get, &url)?;
        if !res.is_success() {
            return Err(fetch_err(format!("GET {} -> {}", url, res.status)));
        }
        if let Some(digest) = digest_header(&res) {
            return Ok(Some(digest));
        }
        let manifest: Manifest = res
            .json()
            .map_err(|e| fetch_err(format!("Invalid manifest: {}", e)))?;
        let layers = manifest.layers();
        if layers.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Digest::from_layers(&layers)))
        }
    }

    /// Send a registry API request, answering a bearer challenge once
    fn call(&mut self, method: Method, url: &str) -> Result<HttpResponse> {
        let res = self.send(method, url)?;
        if let Some(challenge) = AuthChallenge::from_response(&res) {
            log::debug!("Getting token from '{}'", challenge.url);
            self.token = Some(challenge.exchange(&self.http, self.credentials.as_ref())?);
            return self.send(method, url);
        }
        Ok(res)
    }

    fn send(&self, method: Method, url: &str) -> Result<HttpResponse> {
        let bearer = self.token.as_ref().map(|t| format!("Bearer {}", t));
        let mut headers = vec![("Accept", MANIFEST_ACCEPT)];
        if let Some(bearer) = bearer.as_deref() {
            headers.push(("Authorization", bearer));
        }
        match method {
            Method::Get => self.http.get(url, &headers),
            Method::Head => self.http.head(url, &headers),
        }
    }
}

fn digest_header(res: &HttpResponse) -> Option<Digest> {
    let value = res.header("docker-content-digest")?;
    match Digest::new(value) {
        Ok(digest) => Some(digest),
        Err(e) => {
            log::warn!("{}", e);
            None
        }
    }
}

/// Response of the tag listing endpoint
#[derive(Debug, Deserialize)]
struct TagPage {
    results: Vec<RawTag>,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTag {
    name: String,
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    full_size: Option<u64>,
    #[serde(default)]
    last_updated: Option<DateTime<Utc>>,
}

impl RawTag {
    fn into_record(self) -> TagRecord {
        // A tag without a timestamp is treated as the oldest possible
        TagRecord::new(
            &self.name,
            self.id.unwrap_or_default(),
            self.full_size.unwrap_or_default(),
            self.last_updated.unwrap_or_default(),
        )
    }
}

/// The parts of schema 1 and schema 2 manifests naming layers
#[derive(Debug, Default, Deserialize)]
struct Manifest {
    #[serde(default, rename = "fsLayers")]
    fs_layers: Vec<FsLayer>,
    #[serde(default)]
    layers: Vec<Layer>,
}

#[derive(Debug, Deserialize)]
struct FsLayer {
    #[serde(rename = "blobSum")]
    blob_sum: String,
}

#[derive(Debug, Deserialize)]
struct Layer {
    digest: String,
}

impl Manifest {
    fn layers(&self) -> Vec<&str> {
        if !self.fs_layers.is_empty() {
            self.fs_layers.iter().map(|l| l.blob_sum.as_str()).collect()
        } else {
            self.layers.iter().map(|l| l.digest.as_str()).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::{cell::RefCell, collections::VecDeque};

    /// Replays canned responses and records requests
    #[derive(Default)]
    struct Replay {
        responses: RefCell<VecDeque<HttpResponse>>,
        requests: RefCell<Vec<(String, String)>>,
    }

    impl Replay {
        fn new(responses: Vec<HttpResponse>) -> Self {
            Replay {
                responses: RefCell::new(responses.into()),
                requests: RefCell::default(),
            }
        }

        fn next(&self, method: &str, url: &str) -> Result<HttpResponse> {
            self.requests
                .borrow_mut()
                .push((method.to_string(), url.to_string()));
            Ok(self
                .responses
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| HttpResponse::new(500)))
        }
    }

    impl HttpClient for &Replay {
        fn get(&self, url: &str, _headers: &[(&str, &str)]) -> Result<HttpResponse> {
            self.next("GET", url)
        }
        fn head(&self, url: &str, _headers: &[(&str, &str)]) -> Result<HttpResponse> {
            self.next("HEAD", url)
        }
    }

    fn page(body: &str) -> HttpResponse {
        HttpResponse::new(200).with_body(body)
    }

    #[test]
    fn paginated_tags() -> Result<()> {
        let replay = Replay::new(vec![
            page(r#"{"results": [{"name": "r17_0_1", "id": 1, "full_size": 10, "last_updated": "2021-05-01T12:00:00.000000Z"}], "next": "https://hub.docker.com/...?page=2"}"#),
            page(r#"{"results": [{"name": "w_2021_05", "id": 2, "full_size": 20, "last_updated": null}], "next": null}"#),
        ]);
        let client = Client::new(&replay, &ScanConfig::default());
        let tags = client.get_tags()?;
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].name, "r17_0_1");
        assert_eq!(tags[0].size, 10);
        assert_eq!(tags[0].description, "Release 17.0.1");
        assert_eq!(tags[1].last_updated, Utc.timestamp_opt(0, 0).unwrap());

        let requests = replay.requests.borrow();
        assert!(requests[0].1.ends_with("/tags/?page=1"));
        assert!(requests[1].1.ends_with("/tags/?page=2"));
        Ok(())
    }

    #[test]
    fn undecodable_page_is_retrieval_error() {
        let replay = Replay::new(vec![page("<html>oops</html>")]);
        let client = Client::new(&replay, &ScanConfig::default());
        match client.get_tags() {
            Err(Error::Retrieval { url, body, .. }) => {
                assert!(url.contains("page=1"));
                assert_eq!(body.as_deref(), Some("<html>oops</html>"));
            }
            other => panic!("unexpected {:?}", other.map(|t| t.len())),
        }
    }

    #[test]
    fn failed_page_is_retrieval_error() {
        let replay = Replay::new(vec![HttpResponse::new(503).with_body("unavailable")]);
        let client = Client::new(&replay, &ScanConfig::default());
        let err = client.get_tags().unwrap_err();
        assert!(err.to_string().contains("HTTP 503"));
        assert!(err.to_string().contains("unavailable"));
    }

    #[test]
    fn digest_from_head() -> Result<()> {
        let replay = Replay::new(vec![
            HttpResponse::new(200).with_header("Docker-Content-Digest", "sha256:abcdef")
        ]);
        let mut client = Client::new(&replay, &ScanConfig::default());
        let digest = client.get_digest("recommended")?;
        assert_eq!(digest, Some(Digest::new("sha256:abcdef")?));
        assert_eq!(replay.requests.borrow().len(), 1);
        Ok(())
    }

    #[test]
    fn digest_from_layers_after_challenge() -> Result<()> {
        let challenge = r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:lsstsqre/sciplat-lab:pull""#;
        let replay = Replay::new(vec![
            HttpResponse::new(401).with_header("Www-Authenticate", challenge),
            HttpResponse::new(200).with_body(r#"{"token": "secret"}"#),
            HttpResponse::new(200),
            HttpResponse::new(200)
                .with_body(r#"{"fsLayers": [{"blobSum": "a"}, {"blobSum": "b"}]}"#),
        ]);
        let mut client = Client::new(&replay, &ScanConfig::default());
        let digest = client.get_digest("r17_0_1")?;
        assert_eq!(digest, Some(Digest::from_layers(&["a", "b"])));

        let requests = replay.requests.borrow();
        assert_eq!(requests[0].0, "HEAD");
        assert!(requests[1].1.starts_with("https://auth.docker.io/token?service="));
        assert_eq!(requests[2].0, "HEAD");
        assert_eq!(requests[3].0, "GET");
        assert!(requests[3].1.ends_with("/v2/lsstsqre/sciplat-lab/manifests/r17_0_1"));
        assert_eq!(client.token.as_deref(), Some("secret"));
        Ok(())
    }

    #[test]
    fn missing_manifest() {
        let replay = Replay::new(vec![HttpResponse::new(404), HttpResponse::new(404)]);
        let mut client = Client::new(&replay, &ScanConfig::default());
        assert!(matches!(
            client.get_digest("gone"),
            Err(Error::ManifestFetch { .. })
        ));
    }
}
