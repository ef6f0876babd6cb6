//! HTTP transport to the search engine.
//!
//! The repository speaks to the engine through [`Transport`] so index
//! lifecycle steps can be exercised without a running cluster.
//! [`HttpTransport`] is the production implementation over reqwest.

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::config::ElasticsearchConfig;
use crate::error::{CompassError, Result};

/// One request to the engine's REST API.
#[derive(Debug, Clone, PartialEq)]
pub struct EsRequest {
    pub method: Method,
    /// Path below the base URL, already escaped.
    pub path: String,
    pub query: Vec<(&'static str, String)>,
    pub body: Option<Value>,
}

impl EsRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn param(mut self, key: &'static str, value: impl ToString) -> Self {
        self.query.push((key, value.to_string()));
        self
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Status and decoded body of a response. Bodies that are not JSON (or
/// absent, as on `HEAD`) decode to `Value::Null`.
#[derive(Debug, Clone, PartialEq)]
pub struct EsResponse {
    pub status: u16,
    pub body: Value,
}

impl EsResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn is_error(&self) -> bool {
        self.status >= 400
    }

    /// Error type and reason reported by the engine.
    pub fn error_code_and_reason(&self) -> (String, String) {
        let error = &self.body["error"];
        match error {
            Value::Object(_) => (
                error["type"].as_str().unwrap_or_default().to_string(),
                error["reason"].as_str().unwrap_or_default().to_string(),
            ),
            Value::String(reason) => (String::new(), reason.clone()),
            _ => (String::new(), format!("status {}", self.status)),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: EsRequest) -> Result<EsResponse>;
}

/// reqwest based [`Transport`].
pub struct HttpTransport {
    client: Client,
    base: Url,
}

impl HttpTransport {
    pub fn new(config: &ElasticsearchConfig) -> Result<Self> {
        let base = Url::parse(&config.url).map_err(|e| CompassError::Config {
            message: format!("invalid elasticsearch url {:?}: {}", config.url, e),
        })?;
        let client = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("compass/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CompassError::Network {
                message: format!("Failed to create HTTP client: {}", e),
                cause: None,
            })?;
        Ok(Self { client, base })
    }

    fn url(&self, request: &EsRequest) -> Result<Url> {
        let mut url = self
            .base
            .join(&request.path)
            .map_err(|e| CompassError::Other(format!("invalid path {:?}: {}", request.path, e)))?;
        if !request.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &request.query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: EsRequest) -> Result<EsResponse> {
        let url = self.url(&request)?;
        debug!(method = %request.method, %url, "Search engine request");

        let mut builder = self.client.request(request.method.clone(), url.clone());
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        let response = builder.send().await.map_err(|e| CompassError::Network {
            message: format!("{} {} failed: {}", request.method, url, e),
            cause: Some(e.to_string()),
        })?;

        let status = response.status().as_u16();
        let bytes = response.bytes().await.map_err(|e| CompassError::Network {
            message: format!("reading response of {} failed: {}", url, e),
            cause: None,
        })?;
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        Ok(EsResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_code_and_reason() {
        let response = EsResponse::new(
            400,
            json!({"error": {"type": "illegal_argument_exception", "reason": "bad field"}}),
        );
        assert!(response.is_error());
        assert_eq!(
            response.error_code_and_reason(),
            ("illegal_argument_exception".to_string(), "bad field".to_string())
        );

        let response = EsResponse::new(503, Value::Null);
        assert_eq!(response.error_code_and_reason().1, "status 503");
    }

    #[test]
    fn test_url_keeps_base_path_and_query() {
        let transport = HttpTransport::new(&ElasticsearchConfig {
            url: "http://es.local:9200/".to_string(),
            ..Default::default()
        })
        .unwrap();
        let request = EsRequest::new(Method::POST, "universe/_delete_by_query")
            .param("refresh", true)
            .param("ignore_unavailable", true);
        assert_eq!(
            transport.url(&request).unwrap().as_str(),
            "http://es.local:9200/universe/_delete_by_query?refresh=true&ignore_unavailable=true"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        let result = HttpTransport::new(&ElasticsearchConfig {
            url: "not a url".to_string(),
            ..Default::default()
        });
        assert!(matches!(result, Err(CompassError::Config { .. })));
    }
}
