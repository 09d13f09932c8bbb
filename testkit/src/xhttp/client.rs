//! Sending requests.

use super::{Error, Request, Response, Result};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// How long a request may take when no timeout is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Sends [`Request`]s, filling in a base URL, headers, and credentials.
#[derive(Clone, Debug)]
pub struct Client {
    /// The underlying client, shared by clones.
    client: reqwest::Client,
    /// Applied to every request.
    timeout: Duration,
    /// Used by requests without a base URL of their own.
    base_url: Option<String>,
    /// Sent with every request.
    headers: Vec<(String, String)>,
    /// Username and password sent with every request.
    basic_auth: Option<(String, String)>,
}

impl Default for Client {
    fn default() -> Self {
        ClientBuilder::default().build()
    }
}

/// Configures a [`Client`].
#[derive(Debug)]
pub struct ClientBuilder {
    /// See [`ClientBuilder::timeout`].
    timeout: Duration,
    /// See [`ClientBuilder::base_url`].
    base_url: Option<String>,
    /// See [`ClientBuilder::default_header`].
    headers: Vec<(String, String)>,
    /// See [`ClientBuilder::basic_auth`].
    basic_auth: Option<(String, String)>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            base_url: None,
            headers: Vec::new(),
            basic_auth: None,
        }
    }
}

impl ClientBuilder {
    /// How long a request may take, from sending it to reading the whole
    /// body. Defaults to [`DEFAULT_TIMEOUT`].
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The base URL for requests that don't set their own.
    #[must_use]
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// A header sent with every request, before the request's own headers.
    #[must_use]
    pub fn default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Several headers sent with every request.
    #[must_use]
    pub fn default_headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.headers
            .extend(headers.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Credentials sent with every request as basic auth.
    #[must_use]
    pub fn basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.basic_auth = Some((username.into(), password.into()));
        self
    }

    /// Finish configuring the client.
    pub fn build(self) -> Client {
        Client {
            client: reqwest::Client::new(),
            timeout: self.timeout,
            base_url: self.base_url,
            headers: self.headers,
            basic_auth: self.basic_auth,
        }
    }
}

impl Client {
    /// Start configuring a client.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Send `request` and decode the response.
    ///
    /// A status above 299 is not an error: the response comes back with the
    /// error payload as its body.
    ///
    /// # Errors
    /// If the method is not a standard one, the URL is invalid, the request
    /// cannot be sent, or a successful response is not a `T`.
    pub async fn execute<T: DeserializeOwned>(&self, request: Request) -> Result<Response<T>> {
        let method = request.checked_method()?;
        let url = request.url(self.base_url.as_deref())?;

        let mut builder = self
            .client
            .request(method.clone(), url.clone())
            .timeout(self.timeout);
        for (name, value) in self.headers.iter().chain(&request.headers) {
            builder = builder.header(name, value);
        }
        if let Some((username, password)) = &self.basic_auth {
            builder = builder.basic_auth(username, Some(password));
        }
        if let Some(body) = request.body {
            builder = builder.body(body?);
        }

        tracing::debug!(%method, %url, "Executing request");
        let response = builder.send().await.map_err(Error::Execute)?;
        let status = response.status();
        let headers = response.headers().clone();
        let raw_body = response.bytes().await.map_err(Error::Execute)?.to_vec();
        tracing::debug!(%method, %url, %status, "Received response");

        Response::undecoded(status, headers, raw_body)
            .decode()
            .map_err(|(source, response)| Error::Unmarshal {
                type_name: std::any::type_name::<T>(),
                source,
                response: Box::new(response),
            })
    }
}
