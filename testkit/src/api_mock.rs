//! HTTP stubs for services a test talks to.
//!
//! Stubs are described in YAML, keyed by service name:
//!
//! ```yaml
//! employee-service:
//!   - request:
//!       method: GET
//!       path: /api/v1/employee/{{ id }}
//!       headers:
//!         Authorization: Bearer abcd
//!       queryParams:
//!         limit: "{{ limit }}"
//!     response:
//!       status: 200
//!       headers:
//!         Content-Type: application/json
//!       body: '{"name": "{{ name }}"}'
//! ```
//!
//! Each service is mounted under a prefix made from the service and test
//! names, so tests sharing a stub server don't see each other's stubs.

use crate::{
    errors::{Error, Result},
    suite::{Suite, TestScope},
};
use httpmock::{Method, Mock, MockServer, Then, When};
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde::Deserialize;
use serde_json::Value;
use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::{Mutex, PoisonError},
};

lazy_static! {
    /// A `{{ name }}` placeholder.
    static ref TEMPLATE: Regex = Regex::new(r"\{\{(.*?)\}\}").expect("valid template regex");
    /// Characters that can't appear in a sanitised test name.
    static ref NON_ALPHANUMERIC: Regex =
        Regex::new(r"[^a-zA-Z0-9]+").expect("valid sanitiser regex");
}

/// Stub definitions by service name.
pub type MockFile = BTreeMap<String, Vec<MockPath>>;

/// One stubbed request and the response to give it.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct MockPath {
    /// The request to match.
    pub request: MockRequest,
    /// The response to a matching request.
    pub response: MockResponse,
}

/// What a request must look like to match. Every field may hold `{{ name }}`
/// placeholders.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MockRequest {
    /// The HTTP method. Empty means `GET`.
    pub method: String,
    /// A pattern for the path below the service prefix.
    pub path: String,
    /// The expected body, compared as JSON if it parses as JSON. Empty
    /// matches any body.
    pub body: String,
    /// Headers the request must carry, with these exact values.
    pub headers: BTreeMap<String, String>,
    /// Query parameters the request must carry, with these exact values.
    pub query_params: BTreeMap<String, String>,
}

/// The response to a matched request.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct MockResponse {
    /// The status code, 200 unless given.
    pub status: MockStatus,
    /// The response body, sent as is.
    pub body: String,
    /// Headers to send with the response.
    pub headers: BTreeMap<String, String>,
}

impl Default for MockResponse {
    fn default() -> Self {
        Self {
            status: MockStatus::Code(200),
            body: String::new(),
            headers: BTreeMap::new(),
        }
    }
}

/// A response status, either literal or from a placeholder.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum MockStatus {
    /// A literal status code.
    Code(u16),
    /// Text holding `{{ name }}` placeholders that resolves to a status code.
    Template(String),
}

impl MockStatus {
    /// The status code after resolving placeholders. A template that
    /// resolves to nothing, because its parameter was not given, means 200.
    fn resolve(&self, params: &HashMap<String, String>) -> Result<u16> {
        match self {
            Self::Code(code) => Ok(*code),
            Self::Template(template) => {
                let status = resolve_template(template, params);
                match status.trim() {
                    "" => Ok(200),
                    code => code
                        .parse()
                        .map_err(|_| Error::InvalidMock(format!("invalid status {status:?}"))),
                }
            }
        }
    }
}

/// Read stub definitions from `path`.
///
/// # Errors
/// If the file cannot be read or is not a valid definition.
pub fn read_mock_file(path: &Path) -> Result<MockFile> {
    let content = std::fs::read_to_string(path).map_err(|source| Error::MockFileRead {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&content).map_err(|source| Error::MockFileParse {
        path: path.to_path_buf(),
        source,
    })
}

/// Replace each `{{ name }}` in `template` by its value in `params`. Unknown
/// names become empty.
pub fn resolve_template(template: &str, params: &HashMap<String, String>) -> String {
    TEMPLATE
        .replace_all(template, |captures: &Captures| {
            params
                .get(captures[1].trim())
                .cloned()
                .unwrap_or_default()
        })
        .into_owned()
}

/// Turn a test name into a single path segment.
pub fn sanitise_test_name(name: &str) -> String {
    NON_ALPHANUMERIC.replace_all(name, "_").into_owned()
}

/// A stub server: in-process unless a remote one is configured.
pub struct ApiMockServer {
    /// The in-process or connected server.
    server: MockServer,
    /// Whether `server` is a remote one.
    remote: bool,
    /// Ids of the stubs added through this handle, so they can be removed
    /// again without touching stubs other suites added to a shared server.
    mock_ids: Mutex<Vec<usize>>,
}

impl std::fmt::Debug for ApiMockServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiMockServer")
            .field("base_url", &self.server.base_url())
            .field("remote", &self.remote)
            .finish()
    }
}

impl ApiMockServer {
    /// Connect to the server at `address`, or start one in this process.
    async fn start(address: Option<&str>) -> Self {
        match address {
            Some(address) => {
                let address = address
                    .trim_start_matches("http://")
                    .trim_end_matches('/');
                tracing::debug!(%address, "Connecting to remote stub server");
                Self {
                    server: MockServer::connect_async(address).await,
                    remote: true,
                    mock_ids: Mutex::default(),
                }
            }
            None => {
                let server = MockServer::start_async().await;
                tracing::debug!(base_url = %server.base_url(), "Started stub server");
                Self {
                    server,
                    remote: false,
                    mock_ids: Mutex::default(),
                }
            }
        }
    }

    /// The base URL of the server, such as `http://127.0.0.1:41234`.
    pub fn base_url(&self) -> String {
        self.server.base_url()
    }

    /// Add `mock` below `prefix`, with placeholders resolved from `params`.
    async fn stub(&self, prefix: &str, mock: &MockPath, params: &HashMap<String, String>) -> Result<()> {
        let method = parse_method(&resolve_template(&mock.request.method, params))?;
        let path = resolve_template(&mock.request.path, params);
        let pattern = format!(
            "^{}/{}$",
            regex::escape(prefix),
            path.trim_start_matches('/')
        );
        let path_regex = Regex::new(&pattern)
            .map_err(|error| Error::InvalidMock(format!("invalid path {pattern:?}: {error}")))?;

        let resolve_all = |values: &BTreeMap<String, String>| -> Vec<(String, String)> {
            values
                .iter()
                .map(|(name, value)| (name.clone(), resolve_template(value, params)))
                .collect()
        };
        let query_params = resolve_all(&mock.request.query_params);
        let request_headers = resolve_all(&mock.request.headers);
        let request_body = resolve_template(&mock.request.body, params);

        let status = mock.response.status.resolve(params)?;
        let response_headers = resolve_all(&mock.response.headers);
        let response_body = resolve_template(&mock.response.body, params);

        tracing::debug!(?method, %pattern, status, "Adding stub");
        let mock = self
            .server
            .mock_async(move |when: When, then: Then| {
                let mut when = when.method(method).path_matches(path_regex);
                for (name, value) in query_params {
                    when = when.query_param(name, value);
                }
                for (name, value) in request_headers {
                    when = when.header(name, value);
                }
                if !request_body.trim().is_empty() {
                    when = match serde_json::from_str::<Value>(&request_body) {
                        Ok(json) => when.json_body(json),
                        Err(_) => when.body(request_body),
                    };
                }

                let mut then = then.status(status);
                for (name, value) in response_headers {
                    then = then.header(name, value);
                }
                then.body(response_body);
            })
            .await;
        self.mock_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(mock.id);
        Ok(())
    }

    /// Remove every stub added through this handle.
    pub async fn reset(&self) {
        let ids = std::mem::take(
            &mut *self
                .mock_ids
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for id in &ids {
            Mock::new(*id, &self.server).delete_async().await;
        }
        if !ids.is_empty() {
            tracing::debug!(stubs = ids.len(), remote = self.remote, "Removed stubs");
        }
    }
}

/// The method called `method`, ignoring case. Empty means `GET`.
fn parse_method(method: &str) -> Result<Method> {
    Ok(match method.trim().to_uppercase().as_str() {
        "" | "GET" => Method::GET,
        "HEAD" => Method::HEAD,
        "POST" => Method::POST,
        "PUT" => Method::PUT,
        "DELETE" => Method::DELETE,
        "CONNECT" => Method::CONNECT,
        "OPTIONS" => Method::OPTIONS,
        "TRACE" => Method::TRACE,
        "PATCH" => Method::PATCH,
        other => return Err(Error::InvalidMock(format!("unsupported method {other:?}"))),
    })
}

impl TestScope {
    /// The stub server of this suite, started or connected on first use.
    pub async fn api_mock_server(&self) -> &ApiMockServer {
        let address = self
            .settings()
            .api_mock
            .as_ref()
            .map(|settings| settings.address.as_str());
        self.suite()
            .inner
            .api_mock
            .get_or_init(|| ApiMockServer::start(address))
            .await
    }

    /// The path every stub of `service` in this test is mounted under.
    fn mock_prefix(&self, service: &str) -> String {
        format!("/{}/{}", service, sanitise_test_name(self.name()))
    }

    /// Add the stubs described in `file`, resolving placeholders from
    /// `params`, and return the base URL of each service.
    ///
    /// # Errors
    /// If the file is invalid or a stub cannot be built from it.
    pub async fn setup_api_mocks_from_file(
        &self,
        file: impl AsRef<Path>,
        params: &HashMap<String, String>,
    ) -> Result<HashMap<String, String>> {
        let mocks = read_mock_file(file.as_ref())?;
        let server = self.api_mock_server().await;

        let mut urls = HashMap::with_capacity(mocks.len());
        for (service, paths) in &mocks {
            let prefix = self.mock_prefix(service);
            for path in paths {
                server.stub(&prefix, path, params).await?;
            }
            urls.insert(service.clone(), format!("{}{}", server.base_url(), prefix));
        }
        tracing::info!(services = mocks.len(), "API mocks ready");
        Ok(urls)
    }

    /// Add a single stub answering `method path` of `service` with `status`
    /// and `body`, and return the base URL of the service.
    ///
    /// # Errors
    /// If the method is not supported or the path is not a valid pattern.
    pub async fn set_api_mock(
        &self,
        service: &str,
        method: &str,
        path: &str,
        status: u16,
        body: &str,
    ) -> Result<String> {
        let server = self.api_mock_server().await;
        let prefix = self.mock_prefix(service);
        let mock = MockPath {
            request: MockRequest {
                method: method.to_string(),
                path: path.to_string(),
                ..MockRequest::default()
            },
            response: MockResponse {
                status: MockStatus::Code(status),
                body: body.to_string(),
                ..MockResponse::default()
            },
        };
        server.stub(&prefix, &mock, &HashMap::new()).await?;
        Ok(format!("{}{}", server.base_url(), prefix))
    }

    /// Remove every stub this suite added to the server, including other
    /// tests' stubs. On a shared remote server, stubs of other suites stay.
    pub async fn clean_api_mock(&self) {
        self.api_mock_server().await.reset().await;
    }
}

impl Suite {
    /// Remove the stubs the suite added.
    pub(crate) async fn cleanup_api_mocks(&self) {
        if let Some(server) = self.inner.api_mock.get() {
            server.reset().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{read_mock_file, resolve_template, sanitise_test_name, MockStatus};
    use crate::{Error, SuiteRunner};
    use maplit::hashmap;
    use pretty_assertions::assert_eq;
    use reqwest::StatusCode;
    use serde_json::{json, Value};
    use std::{collections::HashMap, path::Path};

    const MOCK_FILE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/testdata/api-mock.yaml");

    fn params(address_id: &str) -> HashMap<String, String> {
        hashmap! {
            "limit".to_string() => "10".to_string(),
            "id".to_string() => "100".to_string(),
            "addressId".to_string() => address_id.to_string(),
        }
    }

    #[test]
    fn templates_resolve_and_unknown_names_are_empty() {
        let params = hashmap! { "name".to_string() => "Bob".to_string() };
        assert_eq!(
            resolve_template("Hello, {{ name }}{{missing}}!", &params),
            "Hello, Bob!"
        );
        assert_eq!(resolve_template("no placeholders", &params), "no placeholders");
    }

    #[test]
    fn test_names_become_one_segment() {
        assert_eq!(
            sanitise_test_name("ApiMockSuite/Name: World!"),
            "ApiMockSuite_Name_World_"
        );
    }

    #[test]
    fn mock_file_is_read() {
        let mocks = read_mock_file(Path::new(MOCK_FILE)).unwrap();
        assert_eq!(
            mocks.keys().collect::<Vec<_>>(),
            ["example-service-1", "example-service-2"]
        );
        let created = &mocks["example-service-1"][1];
        assert_eq!(created.request.method, "POST");
        assert_eq!(
            created.response.status,
            MockStatus::Template("{{ created }}".to_string())
        );
    }

    #[test]
    fn templated_status_without_a_value_is_ok() {
        let status = MockStatus::Template("{{ created }}".to_string());
        assert_eq!(status.resolve(&HashMap::new()).unwrap(), 200);
        assert_eq!(
            status
                .resolve(&hashmap! { "created".to_string() => " 201 ".to_string() })
                .unwrap(),
            201
        );
        assert!(matches!(
            status.resolve(&hashmap! { "created".to_string() => "soon".to_string() }),
            Err(Error::InvalidMock(_))
        ));
    }

    #[test]
    fn missing_mock_file_is_an_error() {
        assert!(matches!(
            read_mock_file(Path::new("testdata/does-not-exist.yaml")),
            Err(Error::MockFileRead { .. })
        ));
    }

    #[tokio::test]
    async fn service_urls_are_mounted_per_test() {
        SuiteRunner::new("ApiMockSuite")
            .filter(".*")
            .settings(|settings| settings.api_mock = None)
            .test("returns_service_urls", |scope| async move {
                let urls = scope
                    .setup_api_mocks_from_file(MOCK_FILE, &params("200"))
                    .await?;
                let base_url = scope.api_mock_server().await.base_url();
                assert_eq!(
                    urls,
                    hashmap! {
                        "example-service-1".to_string() =>
                            format!("{base_url}/example-service-1/ApiMockSuite_returns_service_urls"),
                        "example-service-2".to_string() =>
                            format!("{base_url}/example-service-2/ApiMockSuite_returns_service_urls"),
                    }
                );
                Ok::<_, Error>(())
            })
            .run()
            .await
            .unwrap()
            .assert_success();
    }

    #[tokio::test]
    async fn requests_match_path_pattern_query_and_headers() {
        SuiteRunner::new("ApiMockSuite")
            .filter(".*")
            .settings(|settings| settings.api_mock = None)
            .test("matches", |scope| async move {
                let urls = scope
                    .setup_api_mocks_from_file(MOCK_FILE, &params("200.*"))
                    .await?;
                let url = format!(
                    "{}/api/v1/employee/100/address/20011",
                    urls["example-service-1"]
                );
                let client = reqwest::Client::new();

                let response = client
                    .get(&url)
                    .query(&[("limit", "10"), ("page", "1")])
                    .header("Authorization", "Bearer abcd")
                    .send()
                    .await
                    .unwrap();
                assert_eq!(response.status(), StatusCode::OK);
                assert_eq!(
                    response.headers()["content-type"].to_str().unwrap(),
                    "application/json"
                );
                let body: Value = response.json().await.unwrap();
                assert_eq!(body, json!({"message": "Hello, World!"}));

                let unauthorised = client
                    .get(&url)
                    .query(&[("limit", "10"), ("page", "1")])
                    .send()
                    .await
                    .unwrap();
                assert_eq!(unauthorised.status(), StatusCode::NOT_FOUND);
                Ok::<_, Error>(())
            })
            .run()
            .await
            .unwrap()
            .assert_success();
    }

    #[tokio::test]
    async fn json_bodies_and_templated_status() {
        SuiteRunner::new("ApiMockSuite")
            .filter(".*")
            .settings(|settings| settings.api_mock = None)
            .test("creates", |scope| async move {
                let mut params = params("200");
                params.insert("name".to_string(), "Alice".to_string());
                params.insert("created".to_string(), "201".to_string());
                let urls = scope.setup_api_mocks_from_file(MOCK_FILE, &params).await?;

                let response = reqwest::Client::new()
                    .post(format!("{}/api/v1/employee", urls["example-service-1"]))
                    .json(&json!({"name": "Alice"}))
                    .send()
                    .await
                    .unwrap();
                assert_eq!(response.status(), StatusCode::CREATED);
                assert_eq!(response.text().await.unwrap(), r#"{"id": "100"}"#);
                Ok::<_, Error>(())
            })
            .run()
            .await
            .unwrap()
            .assert_success();
    }

    #[tokio::test]
    async fn response_templates_resolve_per_subtest() {
        SuiteRunner::new("ApiMockSuite")
            .filter(".*")
            .settings(|settings| settings.api_mock = None)
            .test("greets", |scope| async move {
                for name in ["World!", "Bob!", "Alice!"] {
                    let passed = scope
                        .run(&format!("Name: {name}"), |scope| async move {
                            scope.clean_api_mock().await;
                            let mut params = params("200");
                            params.insert("message".to_string(), name.to_string());
                            let urls = scope.setup_api_mocks_from_file(MOCK_FILE, &params).await?;

                            let body: Value =
                                reqwest::get(format!("{}/api/v1/info", urls["example-service-2"]))
                                    .await
                                    .unwrap()
                                    .json()
                                    .await
                                    .unwrap();
                            assert_eq!(body["message"], format!("Hello, {name}"));
                            Ok::<_, Error>(())
                        })
                        .await;
                    assert!(passed);
                }
            })
            .run()
            .await
            .unwrap()
            .assert_success();
    }

    #[tokio::test]
    async fn cleaned_stubs_no_longer_answer() {
        SuiteRunner::new("ApiMockSuite")
            .filter(".*")
            .settings(|settings| settings.api_mock = None)
            .test("cleans", |scope| async move {
                let urls = scope
                    .setup_api_mocks_from_file(MOCK_FILE, &params("200"))
                    .await?;
                let info_url = format!("{}/api/v1/info", urls["example-service-2"]);
                let health_url = scope
                    .set_api_mock("health", "GET", "/ping", 204, "")
                    .await?;
                let ping_url = format!("{health_url}/ping");

                assert_eq!(reqwest::get(&info_url).await.unwrap().status(), StatusCode::OK);
                assert_eq!(reqwest::get(&ping_url).await.unwrap().status(), StatusCode::NO_CONTENT);

                scope.clean_api_mock().await;

                assert_eq!(reqwest::get(&info_url).await.unwrap().status(), StatusCode::NOT_FOUND);
                assert_eq!(reqwest::get(&ping_url).await.unwrap().status(), StatusCode::NOT_FOUND);

                // The server still takes new stubs afterwards.
                scope.set_api_mock("health", "GET", "/ping", 204, "").await?;
                assert_eq!(reqwest::get(&ping_url).await.unwrap().status(), StatusCode::NO_CONTENT);
                Ok::<_, Error>(())
            })
            .run()
            .await
            .unwrap()
            .assert_success();
    }

    #[tokio::test]
    async fn single_stub() {
        SuiteRunner::new("ApiMockSuite")
            .filter(".*")
            .settings(|settings| settings.api_mock = None)
            .test("single", |scope| async move {
                let url = scope
                    .set_api_mock("health", "get", "/ping", 204, "")
                    .await?;
                let response = reqwest::get(format!("{url}/ping")).await.unwrap();
                assert_eq!(response.status(), StatusCode::NO_CONTENT);

                let error = scope
                    .set_api_mock("health", "BREW", "/pot", 418, "")
                    .await
                    .unwrap_err();
                assert_eq!(error.to_string(), r#"invalid api mock: unsupported method "BREW""#);
                Ok::<_, Error>(())
            })
            .run()
            .await
            .unwrap()
            .assert_success();
    }
}
