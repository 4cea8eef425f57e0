//! Transport seam between the login flow and the network
//!
//! The flow only needs "send a request, get back a status, a JSON body and the
//! correlation id header". [`HttpTransport`] provides that over reqwest; tests
//! substitute in-memory implementations.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use scanlogin_core::{AuthConfig, Error, Result, CORRELATION_HEADER};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Extra time granted on top of the long-poll wait before a request times out
const REQUEST_TIMEOUT_SLACK: Duration = Duration::from_secs(5);

/// A GET request relative to the backend base URL
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    /// Path including the leading slash
    pub path: String,
    pub query: Vec<(String, String)>,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            query: Vec::new(),
        }
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }
}

/// Raw response as seen by the API client
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
    /// Value of the correlation header, if the backend sent one
    pub correlation_id: Option<String>,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Performs backend requests
///
/// Cancellation is cooperative: callers race the returned future against their
/// cancellation token and drop it, which aborts the underlying request.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse>;
}

/// reqwest-backed transport
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    /// Build a transport from the session configuration
    ///
    /// Every request carries `Content-Type: application/json` and
    /// `datasource: authmate` unless the configured headers override them.
    pub fn new(config: &AuthConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("datasource", HeaderValue::from_static("authmate"));
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::Config(format!("invalid header name {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::Config(format!("invalid value for header {}: {}", name, e)))?;
            headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.poll.max_wait + REQUEST_TIMEOUT_SLACK)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        let url = format!("{}{}", self.base_url, request.path);
        debug!("GET {}", url);

        let mut builder = self.client.get(&url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::transport(format!("GET {} failed: {}", request.path, e)))?;

        let status = response.status().as_u16();
        let correlation_id = response
            .headers()
            .get(CORRELATION_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::transport(format!("reading {} body failed: {}", request.path, e)))?;

        let body = if bytes.is_empty() {
            Value::Null
        } else {
            match serde_json::from_slice(&bytes) {
                Ok(body) => body,
                Err(e) if (200..300).contains(&status) => {
                    return Err(Error::protocol(format!(
                        "{} returned malformed JSON: {}",
                        request.path, e
                    )))
                }
                Err(_) => Value::String(String::from_utf8_lossy(&bytes).into_owned()),
            }
        };

        Ok(ApiResponse {
            status,
            body,
            correlation_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_request_builder() {
        let request = ApiRequest::get("/auth/wx/code2info").with_query("code", "abc");
        assert_eq!(request.path, "/auth/wx/code2info");
        assert_eq!(request.query, vec![("code".to_string(), "abc".to_string())]);
    }

    #[test]
    fn test_rejects_invalid_header() {
        let config = AuthConfig::new("c").with_header("bad header", "v");
        assert!(matches!(HttpTransport::new(&config), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_send_extracts_correlation_and_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/wx/config"))
            .and(header("datasource", "tenant-a"))
            .and(header("content-type", "application/json"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("X-Trace-Id", "trace-1")
                    .set_body_json(json!({"success": true, "data": {"appid": "wx1"}})),
            )
            .mount(&server)
            .await;

        let config = AuthConfig::new("c")
            .with_base_url(server.uri())
            .with_header("datasource", "tenant-a");
        let transport = HttpTransport::new(&config).unwrap();

        let response = transport.send(ApiRequest::get("/auth/wx/config")).await.unwrap();
        assert!(response.is_success());
        assert_eq!(response.correlation_id.as_deref(), Some("trace-1"));
        assert_eq!(response.body["data"]["appid"], "wx1");
    }

    #[tokio::test]
    async fn test_send_query_and_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/wx/code2info"))
            .and(query_param("code", "a b"))
            .respond_with(ResponseTemplate::new(502).set_body_string("<html>bad gateway</html>"))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(&AuthConfig::new("c").with_base_url(server.uri())).unwrap();
        let response = transport
            .send(ApiRequest::get("/auth/wx/code2info").with_query("code", "a b"))
            .await
            .unwrap();
        assert_eq!(response.status, 502);
        assert!(!response.is_success());
        assert!(response.correlation_id.is_none());
        assert_eq!(response.body, Value::String("<html>bad gateway</html>".to_string()));
    }

    #[tokio::test]
    async fn test_send_malformed_success_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{not json"))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(&AuthConfig::new("c").with_base_url(server.uri())).unwrap();
        let err = transport.send(ApiRequest::get("/anything")).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        let transport =
            HttpTransport::new(&AuthConfig::new("c").with_base_url("http://127.0.0.1:9")).unwrap();
        let err = transport.send(ApiRequest::get("/x")).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, Error::Transport(_)));
    }
}
