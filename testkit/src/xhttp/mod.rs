//! A small HTTP client for calling services under test.
//!
//! Requests are described with [`Request`], sent with a [`Client`], and
//! come back as a [`Response`] whose body is decoded as JSON for successful
//! statuses and kept as an error payload otherwise.
//!
//! ```no_run
//! use serde_json::Value;
//! use testkit::xhttp::{self, Request};
//!
//! # async fn example() -> Result<(), xhttp::Error> {
//! let response = xhttp::get::<Value>(
//!     Request::default()
//!         .base_url("http://localhost:8080")
//!         .path(&["api", "v1", "orders"])
//!         .query_param("region", "us"),
//! )
//! .await?;
//! assert_eq!(response.status_code, 200);
//! # Ok(())
//! # }
//! ```

mod client;
mod request;
mod response;

pub use client::{Client, ClientBuilder, DEFAULT_TIMEOUT};
pub use request::Request;
pub use response::{Body, ErrorBody, Response};

use lazy_static::lazy_static;
use reqwest::Method;
use serde::de::DeserializeOwned;
use thiserror::Error;

lazy_static! {
    /// The client behind [`get`], [`post`], [`put`] and [`delete`].
    static ref DEFAULT_CLIENT: Client = Client::default();
}

/// Errors from building, sending, or decoding a request.
#[derive(Debug, Error)]
pub enum Error {
    /// The request method is not a standard HTTP method.
    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),

    /// The base URL and path don't make a valid URL.
    #[error("invalid url {url:?}: {source}")]
    InvalidUrl {
        /// The URL that failed to parse.
        url: String,
        /// Why it failed.
        source: url::ParseError,
    },

    /// A JSON body could not be serialised.
    #[error("failed to encode request body: {0}")]
    Encode(#[source] serde_json::Error),

    /// The request could not be sent or its response not read.
    #[error("failed to execute request: {0}")]
    Execute(#[source] reqwest::Error),

    /// A successful response whose body is not a `type_name`. The raw
    /// response is kept so tests can still look at it.
    #[error("failed to unmarshal response as type {type_name}: {source}")]
    Unmarshal {
        /// The type the body was decoded as.
        type_name: &'static str,
        /// Why decoding failed.
        source: serde_json::Error,
        /// The response, with its body undecoded.
        response: Box<Response<()>>,
    },
}

/// A `Result` using the HTTP client's [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Send `request` as a `GET` with the shared default client.
///
/// # Errors
/// As for [`Client::execute`].
pub async fn get<T: DeserializeOwned>(request: Request) -> Result<Response<T>> {
    DEFAULT_CLIENT.execute(request.method(Method::GET)).await
}

/// Send `request` as a `POST` with the shared default client.
///
/// # Errors
/// As for [`Client::execute`].
pub async fn post<T: DeserializeOwned>(request: Request) -> Result<Response<T>> {
    DEFAULT_CLIENT.execute(request.method(Method::POST)).await
}

/// Send `request` as a `PUT` with the shared default client.
///
/// # Errors
/// As for [`Client::execute`].
pub async fn put<T: DeserializeOwned>(request: Request) -> Result<Response<T>> {
    DEFAULT_CLIENT.execute(request.method(Method::PUT)).await
}

/// Send `request` as a `DELETE` with the shared default client.
///
/// # Errors
/// As for [`Client::execute`].
pub async fn delete<T: DeserializeOwned>(request: Request) -> Result<Response<T>> {
    DEFAULT_CLIENT.execute(request.method(Method::DELETE)).await
}

#[cfg(test)]
mod tests {
    use super::{Body, ErrorBody, Error, Request, Response};
    use crate::TestScope;
    use maplit::hashmap;
    use parameterized::parameterized;
    use serde_json::{json, Map, Value};
    use std::collections::HashMap;
    use testkit_macro::testkit_test;

    const REQUEST_MOCKS: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/testdata/clients/request.yaml");

    async fn call(
        method: &str,
        request: Request,
    ) -> super::Result<Response<Map<String, Value>>> {
        match method {
            "GET" => super::get(request).await,
            "POST" => super::post(request).await,
            "PUT" => super::put(request).await,
            "DELETE" => super::delete(request).await,
            other => panic!("no helper for {other}"),
        }
    }

    async fn mock_service(
        scope: &TestScope,
        method: &str,
        status: u16,
        body: &str,
    ) -> (String, String) {
        let random_id = uuid::Uuid::new_v4().to_string();
        let params: HashMap<String, String> = hashmap! {
            "method".to_string() => method.to_string(),
            "status".to_string() => status.to_string(),
            "body".to_string() => body.to_string(),
            "randomID".to_string() => random_id.clone(),
        };
        let urls = scope
            .setup_api_mocks_from_file(REQUEST_MOCKS, &params)
            .await
            .unwrap();
        (urls["example-service-1"].clone(), random_id)
    }

    fn request(base_url: &str, random_id: &str) -> Request {
        Request::default()
            .base_url(base_url)
            .path(&["/api/v1", random_id])
            .query_param("region", "us")
            .header("Authorization", "Bearer abcd")
            .header("Content-Type", "application/json")
    }

    #[testkit_test(|settings, method: &'static str, status: u16| settings.api_mock = None)]
    #[parameterized(
        method = { "GET", "GET", "POST", "POST", "PUT", "PUT", "DELETE", "DELETE" },
        status = { 200, 404, 200, 500, 200, 404, 200, 500 }
    )]
    async fn helpers_decode_by_status(scope: TestScope) {
        let body = if status == 200 {
            r#"{"name": "test"}"#
        } else {
            r#"{"error": "failed"}"#
        };
        let (base_url, random_id) = mock_service(&scope, method, status, body).await;

        let response = call(method, request(&base_url, &random_id)).await.unwrap();

        assert_eq!(response.status_code, status);
        if status == 200 {
            assert_eq!(response.body.ok(), Some(&json!({"name": "test"}).as_object().cloned().unwrap()));
        } else {
            assert_eq!(
                response.body,
                Body::Error(ErrorBody::Json(
                    json!({"error": "failed"}).as_object().cloned().unwrap()
                ))
            );
        }
    }

    #[testkit_test(|settings| settings.api_mock = None)]
    async fn invalid_json_keeps_raw_response(scope: TestScope) {
        let (base_url, random_id) = mock_service(&scope, "GET", 200, "not-a-json").await;

        let error = super::get::<Map<String, Value>>(request(&base_url, &random_id))
            .await
            .unwrap_err();

        let Error::Unmarshal { response, .. } = &error else {
            panic!("unexpected error: {error}");
        };
        assert_eq!(response.status_code, 200);
        assert_eq!(response.raw_body, b"not-a-json");
        assert!(error
            .to_string()
            .starts_with("failed to unmarshal response as type serde_json::map::Map<"));
    }

    #[testkit_test(|settings| settings.api_mock = None)]
    async fn plain_text_errors_are_kept_as_text(scope: TestScope) {
        let (base_url, random_id) = mock_service(&scope, "GET", 503, "down for maintenance").await;

        let response = super::get::<Value>(request(&base_url, &random_id))
            .await
            .unwrap();

        assert_eq!(response.status, "503 Service Unavailable");
        assert_eq!(
            response.body,
            Body::Error(ErrorBody::Text("down for maintenance".to_string()))
        );
    }
}
