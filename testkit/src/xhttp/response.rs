//! Responses and their decoded bodies.

use crate::maps::JsonMap;
use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Statuses above this are errors.
const LAST_SUCCESS_STATUS: u16 = 299;

/// A response to a [`Request`](super::Request).
#[derive(Clone, Debug)]
pub struct Response<T> {
    /// The status line, such as `200 OK`.
    pub status: String,
    /// The numeric status.
    pub status_code: u16,
    /// The response headers.
    pub headers: HeaderMap,
    /// The decoded body.
    pub body: Body<T>,
    /// The body exactly as received.
    pub raw_body: Vec<u8>,
}

/// The decoded body of a [`Response`].
#[derive(Clone, Debug, PartialEq)]
pub enum Body<T> {
    /// A successful response, decoded as `T`.
    Ok(T),
    /// An error response.
    Error(ErrorBody),
}

impl<T> Body<T> {
    /// The decoded body of a successful response.
    pub fn ok(&self) -> Option<&T> {
        match self {
            Self::Ok(body) => Some(body),
            Self::Error(_) => None,
        }
    }

    /// The payload of an error response.
    pub fn error(&self) -> Option<&ErrorBody> {
        match self {
            Self::Ok(_) => None,
            Self::Error(body) => Some(body),
        }
    }
}

/// An error payload: a JSON object if it parses as one, else the text.
#[derive(Clone, Debug, PartialEq)]
pub enum ErrorBody {
    /// The payload was a JSON object.
    Json(JsonMap),
    /// Anything else, decoded lossily as UTF-8.
    Text(String),
}

impl ErrorBody {
    /// Decode `raw` as a JSON object, falling back to text.
    fn parse(raw: &[u8]) -> Self {
        match serde_json::from_slice::<JsonMap>(raw) {
            Ok(object) => Self::Json(object),
            Err(_) => Self::Text(String::from_utf8_lossy(raw).into_owned()),
        }
    }
}

impl<T> Response<T> {
    /// Whether the status is below 300.
    pub fn is_success(&self) -> bool {
        self.status_code <= LAST_SUCCESS_STATUS
    }

    /// The first value of the header `name`, if it is text.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
    }

    /// The raw body as text, replacing invalid UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.raw_body).into_owned()
    }

    /// The raw body parsed as JSON, whatever the status.
    ///
    /// # Errors
    /// If the raw body is not valid JSON.
    pub fn json(&self) -> serde_json::Result<Value> {
        serde_json::from_slice(&self.raw_body)
    }
}

impl Response<()> {
    /// A response with nothing decoded yet. Its body is `Body::Ok(())` for
    /// any status, so only `raw_body` says what was sent.
    pub(super) fn undecoded(
        status_code: reqwest::StatusCode,
        headers: HeaderMap,
        raw_body: Vec<u8>,
    ) -> Self {
        let status = match status_code.canonical_reason() {
            Some(reason) => format!("{} {}", status_code.as_u16(), reason),
            None => status_code.as_u16().to_string(),
        };
        Self {
            status,
            status_code: status_code.as_u16(),
            headers,
            body: Body::Ok(()),
            raw_body,
        }
    }

    /// Decode the body: as `T` for a successful status, as an [`ErrorBody`]
    /// otherwise.
    ///
    /// # Errors
    /// If the status is successful but the body is not a `T`. The error
    /// carries this response back.
    pub(super) fn decode<T: DeserializeOwned>(self) -> Result<Response<T>, (serde_json::Error, Self)> {
        let body = if self.is_success() {
            match serde_json::from_slice::<T>(&self.raw_body) {
                Ok(body) => Body::Ok(body),
                Err(error) => return Err((error, self)),
            }
        } else {
            Body::Error(ErrorBody::parse(&self.raw_body))
        };

        Ok(Response {
            status: self.status,
            status_code: self.status_code,
            headers: self.headers,
            body,
            raw_body: self.raw_body,
        })
    }
}
