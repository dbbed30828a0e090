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

//! Connection-level configuration.
//!
//! Everything tunable about a connection lives here: polling cadence, query
//! timeout, download parallelism, link-expiry handling, the retry policy and
//! the underlying HTTP client knobs.

use std::time::Duration;

/// Configuration for the HTTP transport.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Connection timeout duration.
    pub connect_timeout: Duration,
    /// Read timeout duration.
    pub read_timeout: Duration,
    /// Maximum number of idle connections per host.
    pub max_connections_per_host: usize,
    /// User agent string.
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            max_connections_per_host: 100,
            user_agent: format!("lakestream/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Retry behavior for transfers against the warehouse and external storage.
///
/// Transient network failures back off exponentially and are bounded by
/// `max_attempts`. Service-unavailable (503) and rate-limited (429) responses
/// additionally carry their own cumulative wall-clock budget, measured from
/// the first retry of that condition; they stop at the attempt cap or the
/// budget, whichever triggers first.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Base delay for exponential backoff.
    pub base_delay: Duration,
    /// Upper bound on a single backoff delay.
    pub max_delay: Duration,
    /// Multiplier applied per attempt.
    pub backoff_factor: u32,
    /// Maximum number of attempts (first attempt included).
    pub max_attempts: u32,
    /// Cumulative wall-clock budget for retrying 503 responses.
    pub unavailable_retry_timeout: Duration,
    /// Cumulative wall-clock budget for retrying 429 responses.
    pub rate_limit_retry_timeout: Duration,
    /// Additional HTTP status codes treated as transient (beyond 503/429).
    pub extra_retryable_statuses: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2,
            max_attempts: 5,
            unavailable_retry_timeout: Duration::from_secs(900),
            rate_limit_retry_timeout: Duration::from_secs(120),
            extra_retryable_statuses: vec![502, 504],
        }
    }
}

/// Per-connection configuration for statement execution and result streaming.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Delay between successive status polls of a running statement.
    pub poll_interval: Duration,
    /// Overall deadline for a statement to reach a terminal state.
    pub query_timeout: Duration,
    /// Maximum number of result chunks downloaded concurrently.
    pub max_parallel_downloads: usize,
    /// Safety margin subtracted from a link's expiry when deciding whether
    /// it is still usable.
    pub link_expiry_margin: Duration,
    /// How many times a chunk download may refresh its link after an
    /// authorization failure before giving up.
    pub link_refresh_limit: u32,
    /// Downloads slower than this emit a warning.
    pub min_download_speed_mbps: f64,
    /// Retry policy for all transfers.
    pub retry: RetryConfig,
    /// HTTP transport settings.
    pub http: HttpConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            query_timeout: Duration::from_secs(600),
            max_parallel_downloads: 8,
            link_expiry_margin: Duration::from_secs(30),
            link_refresh_limit: 3,
            min_download_speed_mbps: 0.1,
            retry: RetryConfig::default(),
            http: HttpConfig::default(),
        }
    }
}
