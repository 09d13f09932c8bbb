//! Describing a request.

use super::{Error, Result};
use reqwest::Method;
use serde::Serialize;
use url::Url;

/// Methods a [`Request`] may use.
const SUPPORTED_METHODS: &[&str] = &[
    "GET", "POST", "PUT", "PATCH", "DELETE", "CONNECT", "OPTIONS", "TRACE", "HEAD",
];

/// A request to send with a [`Client`](super::Client).
///
/// Anything not set here falls back to the client: the base URL, and the
/// headers, which are sent before the request's own.
#[derive(Debug)]
pub struct Request {
    pub(super) method: String,
    pub(super) base_url: Option<String>,
    pub(super) path: String,
    pub(super) headers: Vec<(String, String)>,
    pub(super) query: Vec<(String, String)>,
    pub(super) body: Option<Result<Vec<u8>>>,
}

impl Default for Request {
    /// A `GET` with nothing else set.
    fn default() -> Self {
        Self::new(Method::GET)
    }
}

impl Request {
    /// Start a request with `method`, which is checked when the request is
    /// sent.
    pub fn new(method: impl AsRef<str>) -> Self {
        Self {
            method: method.as_ref().to_string(),
            base_url: None,
            path: String::new(),
            headers: Vec::new(),
            query: Vec::new(),
            body: None,
        }
    }

    /// Replace the method.
    #[must_use]
    pub fn method(mut self, method: impl AsRef<str>) -> Self {
        self.method = method.as_ref().to_string();
        self
    }

    /// Use `base_url` instead of the client's.
    #[must_use]
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Set the path below the base URL, joining `segments` with single
    /// slashes.
    #[must_use]
    pub fn path(mut self, segments: &[&str]) -> Self {
        self.path = segments
            .iter()
            .map(|segment| segment.trim_matches('/'))
            .filter(|segment| !segment.is_empty())
            .collect::<Vec<_>>()
            .join("/");
        self
    }

    /// Add a header. Repeating a name sends it more than once.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Add several headers.
    #[must_use]
    pub fn headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.headers
            .extend(headers.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Add a query parameter. Repeating a name sends it more than once.
    #[must_use]
    pub fn query_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Add several query parameters.
    #[must_use]
    pub fn query_params<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.query
            .extend(params.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Send `body` as it is.
    #[must_use]
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(Ok(body.into()));
        self
    }

    /// Send `value` encoded as JSON, with a JSON content type unless one was
    /// already given. An encoding failure is reported when the request is
    /// sent.
    #[must_use]
    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        self.body = Some(serde_json::to_vec(value).map_err(Error::Encode));
        let has_content_type = self
            .headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case("content-type"));
        if !has_content_type {
            self.headers
                .push(("Content-Type".to_string(), "application/json".to_string()));
        }
        self
    }

    /// The method, if it is one of the standard ones. Case is ignored.
    pub(super) fn checked_method(&self) -> Result<Method> {
        let upper = self.method.to_uppercase();
        if !SUPPORTED_METHODS.contains(&upper.as_str()) {
            return Err(Error::UnsupportedMethod(self.method.clone()));
        }
        Method::from_bytes(upper.as_bytes()).map_err(|_| Error::UnsupportedMethod(self.method.clone()))
    }

    /// The full URL: the base URL, then the path, then the query. Any query
    /// already on the base URL is replaced.
    pub(super) fn url(&self, default_base_url: Option<&str>) -> Result<Url> {
        let base = self
            .base_url
            .as_deref()
            .or(default_base_url)
            .unwrap_or_default();
        let mut url = Url::parse(base).map_err(|source| Error::InvalidUrl {
            url: base.to_string(),
            source,
        })?;

        if !self.path.is_empty() {
            let path = format!("{}/{}", url.path().trim_end_matches('/'), self.path);
            url.set_path(&path);
        }

        url.set_query(None);
        if !self.query.is_empty() {
            url.query_pairs_mut().extend_pairs(&self.query);
        }
        Ok(url)
    }
}
