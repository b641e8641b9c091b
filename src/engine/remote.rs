//! Remote Call Client
//!
//! Single-shot JSON calls against the appliance API. There are no retries at
//! this layer; polling lives in the callers.

use reqwest::blocking::Client;
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub use reqwest::Method;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("request to {url} failed: {detail}")]
    Network { url: String, detail: String },
    #[error("HTTP client error: {0}")]
    Client(String),
}

impl RemoteError {
    fn from_reqwest(url: &str, e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout {
                url: url.to_string(),
            }
        } else {
            Self::Network {
                url: url.to_string(),
                detail: e.to_string(),
            }
        }
    }
}

/// Opaque access credential, sent verbatim as the `Authorization` header
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Returns `None` when the header is absent or blank
    pub fn parse(header: Option<&str>) -> Option<Self> {
        let value = header?.trim();
        if value.is_empty() {
            return None;
        }
        Some(Self(value.to_string()))
    }

    pub fn header_value(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

#[derive(Debug, Clone)]
pub struct RemoteRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
    pub timeout: Duration,
}

impl RemoteRequest {
    pub fn new(method: Method, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            timeout,
        }
    }

    pub fn get(url: impl Into<String>, timeout: Duration) -> Self {
        Self::new(Method::GET, url, timeout)
    }

    pub fn post(url: impl Into<String>, timeout: Duration) -> Self {
        Self::new(Method::POST, url, timeout)
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn authorized(self, credential: &Credential) -> Self {
        self.header("Authorization", credential.header_value())
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Status code plus the parsed body (an empty object when unparseable)
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteResponse {
    pub status: u16,
    pub body: Value,
}

impl RemoteResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.field(key).and_then(Value::as_str)
    }
}

/// The one primitive every higher layer talks through
pub trait RemoteCall: Send + Sync {
    fn call(&self, request: &RemoteRequest) -> Result<RemoteResponse, RemoteError>;
}

/// Parse a response body, never failing
pub fn parse_body(bytes: &[u8]) -> Value {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Value::Object(Map::new());
    }
    serde_json::from_slice(bytes).unwrap_or_else(|_| Value::Object(Map::new()))
}

/// Production client backed by `reqwest::blocking`
pub struct HttpRemoteClient {
    client: Client,
}

impl HttpRemoteClient {
    pub fn new(accept_invalid_certs: bool) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .user_agent(concat!("ngfw-updater/", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .map_err(|e| RemoteError::Client(e.to_string()))?;
        Ok(Self { client })
    }
}

impl RemoteCall for HttpRemoteClient {
    fn call(&self, request: &RemoteRequest) -> Result<RemoteResponse, RemoteError> {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        tracing::debug!(method = %request.method, url = %request.url, "remote call");
        let response = builder
            .send()
            .map_err(|e| RemoteError::from_reqwest(&request.url, e))?;
        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .map_err(|e| RemoteError::from_reqwest(&request.url, e))?;

        Ok(RemoteResponse {
            status,
            body: parse_body(&bytes),
        })
    }
}
