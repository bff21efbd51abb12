use crate::error::*;
use serde::de::DeserializeOwned;
use std::{collections::HashMap, io::Read};
use url::Url;

/// Upper bound of a response body kept in memory
const MAX_BODY_BYTES: u64 = 16 * 1024 * 1024;

/// Minimal HTTP response
///
/// Every status is an ordinary response. Only transport failures are errors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    /// Header names are lower-cased
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        HttpResponse {
            status,
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|s| s.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Transport used to talk to the registry
///
/// Implemented by [UreqClient] for real registries, and by test doubles.
pub trait HttpClient {
    fn get(&self, url: &str, headers: &[(&str, &str)]) -> Result<HttpResponse>;
    fn head(&self, url: &str, headers: &[(&str, &str)]) -> Result<HttpResponse>;
}

/// Append query parameters to a URL
pub fn with_query(url: &str, params: &[(&str, &str)]) -> Result<String> {
    let mut url = Url::parse(url)?;
    if !params.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in params {
            pairs.append_pair(key, value);
        }
    }
    Ok(url.to_string())
}

/// [HttpClient] backed by a blocking `ureq` agent
#[derive(Debug, Clone)]
pub struct UreqClient {
    agent: ureq::Agent,
}

impl Default for UreqClient {
    fn default() -> Self {
        Self::new()
    }
}

impl UreqClient {
    pub fn new() -> Self {
        UreqClient {
            agent: ureq::Agent::new(),
        }
    }

    fn send(&self, req: ureq::Request, headers: &[(&str, &str)]) -> Result<HttpResponse> {
        let req = headers
            .iter()
            .fold(req, |req, (name, value)| req.set(name, value));
        match req.call() {
            Ok(res) => Self::read(res),
            Err(ureq::Error::Status(_, res)) => Self::read(res),
            Err(ureq::Error::Transport(e)) => Err(e.into()),
        }
    }

    fn read(res: ureq::Response) -> Result<HttpResponse> {
        let status = res.status();
        let headers = res
            .headers_names()
            .into_iter()
            .filter_map(|name| {
                let value = res.header(&name)?.to_string();
                Some((name.to_ascii_lowercase(), value))
            })
            .collect();
        let mut body = Vec::new();
        res.into_reader()
            .take(MAX_BODY_BYTES)
            .read_to_end(&mut body)?;
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

impl HttpClient for UreqClient {
    fn get(&self, url: &str, headers: &[(&str, &str)]) -> Result<HttpResponse> {
        log::info!("GET {}", url);
        self.send(self.agent.get(url), headers)
    }

    fn head(&self, url: &str, headers: &[(&str, &str)]) -> Result<HttpResponse> {
        log::info!("HEAD {}", url);
        self.send(self.agent.head(url), headers)
    }
}
