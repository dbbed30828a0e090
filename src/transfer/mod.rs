// Copyright (c) 2025 Lakestream Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Transport abstraction and retrying executor.
//!
//! [`Transport`] performs exactly one request/response roundtrip with no
//! retry logic of its own; [`retry::TransferRetryExecutor`] layers the retry
//! policy on top. Protocol clients and chunk downloads all go through the
//! executor, so retry behavior is uniform and the whole stack is testable
//! against a mock transport.

pub mod backoff;
pub mod retry;

pub use retry::{RetryContext, TransferRetryExecutor};

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Method;

use crate::config::HttpConfig;
use crate::error::{Error, Result};

/// A single outbound request.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub method: Method,
    pub url: String,
    /// Request-specific headers, applied after (and overriding) the
    /// session headers.
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
    /// Whether to attach the session's headers (false for pre-signed
    /// storage links, which carry their own authorization).
    pub authenticated: bool,
}

impl TransferRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            authenticated: true,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn unauthenticated(mut self) -> Self {
        self.authenticated = false;
        self
    }

    pub fn json<T: serde::Serialize>(mut self, value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value)
            .map_err(|e| Error::protocol(format!("failed to encode request body: {e}")))?;
        self.headers
            .push(("Content-Type".to_string(), "application/json".to_string()));
        self.body = Some(Bytes::from(body));
        Ok(self)
    }
}

/// A completed roundtrip: the server answered, with whatever status.
#[derive(Debug, Clone)]
pub struct TransferResponse {
    pub status: u16,
    /// Parsed `Retry-After` header, when the server sent one.
    pub retry_after: Option<Duration>,
    pub body: Bytes,
}

impl TransferResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Network-level failure: the roundtrip did not complete.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("i/o error: {0}")]
    Io(String),
}

/// One request/response roundtrip against the network. No retries here.
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    async fn roundtrip(
        &self,
        request: &TransferRequest,
    ) -> std::result::Result<TransferResponse, TransportError>;
}

/// Production [`Transport`] backed by a pooled reqwest client.
#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    /// Headers attached to every authenticated request (e.g. Authorization).
    session_headers: Vec<(String, String)>,
}

impl HttpTransport {
    pub fn new(config: &HttpConfig, session_headers: Vec<(String, String)>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout)
            .pool_max_idle_per_host(config.max_connections_per_host)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| Error::transport(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            session_headers,
        })
    }

    pub fn shared(config: &HttpConfig, session_headers: Vec<(String, String)>) -> Result<Arc<Self>> {
        Ok(Arc::new(Self::new(config, session_headers)?))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn roundtrip(
        &self,
        request: &TransferRequest,
    ) -> std::result::Result<TransferResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url);

        if request.authenticated {
            for (name, value) in &self.session_headers {
                builder = builder.header(name, value);
            }
        }
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(ref body) = request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(classify_reqwest_error)?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);

        let body = response.bytes().await.map_err(classify_reqwest_error)?;

        Ok(TransferResponse {
            status,
            retry_after,
            body,
        })
    }
}

fn classify_reqwest_error(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout(error.to_string())
    } else if error.is_connect() {
        TransportError::Connect(error.to_string())
    } else {
        TransportError::Io(error.to_string())
    }
}
