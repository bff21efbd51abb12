use super::http::{with_query, HttpClient, HttpResponse};
use crate::error::*;
use regex::Regex;
use serde::Deserialize;

/// Basic credentials presented to the token realm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// base64 of `username:password`
    octet: String,
}

impl Credentials {
    pub fn new(username: &str, password: &str) -> Self {
        Credentials {
            octet: base64::encode(format!("{}:{}", username, password)),
        }
    }

    pub fn header(&self) -> String {
        format!("Basic {}", self.octet)
    }
}

/// WWW-Authentication challenge
///
/// ```
/// use labpuller::registry::AuthChallenge;
///
/// let auth = AuthChallenge::from_header(
///   r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:lsstsqre/sciplat-lab:pull""#,
/// ).unwrap();
///
/// assert_eq!(auth, AuthChallenge {
///   url: "https://auth.docker.io/token".to_string(),
///   service: "registry.docker.io".to_string(),
///   scope: "repository:lsstsqre/sciplat-lab:pull".to_string(),
/// });
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub url: String,
    pub service: String,
    pub scope: String,
}

lazy_static::lazy_static! {
    static ref PARAM_RE: Regex = Regex::new(r#"([A-Za-z_]+)=(?:"([^"]*)"|([^,\s]*))"#).unwrap();
}

impl AuthChallenge {
    pub fn from_header(header: &str) -> Result<Self> {
        let err = || Error::UnSupportedAuthHeader(header.to_string());
        let (ty, params) = header.trim().split_once(' ').ok_or_else(err)?;
        if !ty.eq_ignore_ascii_case("Bearer") {
            return Err(err());
        }

        let mut url = None;
        let mut service = None;
        let mut scope = None;
        for cap in PARAM_RE.captures_iter(params) {
            let value = cap
                .get(2)
                .or_else(|| cap.get(3))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            match &cap[1] {
                "realm" => url = Some(value),
                "service" => service = Some(value),
                "scope" => scope = Some(value),
                _ => continue,
            }
        }
        Ok(Self {
            url: url.ok_or_else(err)?,
            service: service.ok_or_else(err)?,
            scope: scope.ok_or_else(err)?,
        })
    }

    /// Read the challenge of a `401 Unauthorized` response
    pub fn from_response(res: &HttpResponse) -> Option<Self> {
        if res.status != 401 {
            return None;
        }
        let header = res.header("www-authenticate")?;
        match Self::from_header(header) {
            Ok(challenge) => Some(challenge),
            Err(e) => {
                log::warn!("{}", e);
                None
            }
        }
    }

    /// Exchange this challenge for a bearer token at the realm endpoint
    pub fn exchange<H: HttpClient>(
        &self,
        http: &H,
        credentials: Option<&Credentials>,
    ) -> Result<String> {
        let url = with_query(
            &self.url,
            &[("service", self.service.as_str()), ("scope", self.scope.as_str())],
        )?;
        let basic = credentials.map(|c| c.header());
        let mut headers = vec![("Accept", "application/json")];
        if let Some(basic) = basic.as_deref() {
            headers.push(("Authorization", basic));
        }
        let res = http.get(&url, &headers)?;
        if !res.is_success() {
            return Err(Error::AuthorizationFailed(format!(
                "{} returned HTTP {}",
                self.url, res.status
            )));
        }
        let token = res.json::<Token>()?;
        token
            .token
            .or(token.access_token)
            .ok_or_else(|| Error::AuthorizationFailed(format!("{} returned no token", self.url)))
    }
}

#[derive(Deserialize)]
struct Token {
    token: Option<String>,
    access_token: Option<String>,
}
