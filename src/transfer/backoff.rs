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

//! Pure retry policy: failure classification and delay computation.
//!
//! No clocks, no sleeping, no I/O. The executor in [`super::retry`] owns
//! time; this module only answers "is this retryable, and how long should
//! the next wait be".

use std::time::Duration;

use reqwest::Method;

use crate::config::RetryConfig;

use super::TransportError;

/// How a failed attempt ended, as seen by the policy.
#[derive(Debug, Clone)]
pub enum AttemptFailure {
    /// The roundtrip itself failed (connect, reset, timeout).
    Network(TransportError),
    /// The server answered with a non-success status.
    Status {
        status: u16,
        retry_after: Option<Duration>,
    },
}

/// Retry classification of a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient network failure: exponential backoff, bounded by the
    /// attempt cap.
    TransientNetwork,
    /// 503 Service Unavailable: bounded by the attempt cap and its own
    /// wall-clock budget, whichever triggers first.
    ServiceUnavailable { retry_after: Option<Duration> },
    /// 429 Too Many Requests: bounded by the attempt cap and its own
    /// wall-clock budget, whichever triggers first.
    RateLimited { retry_after: Option<Duration> },
    /// Not retryable at all.
    NonRetryable,
}

/// Deterministic backoff policy shared by all transfers.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    base_delay: Duration,
    max_delay: Duration,
    backoff_factor: u32,
    max_attempts: u32,
    extra_retryable_statuses: Vec<u16>,
}

impl BackoffPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            backoff_factor: config.backoff_factor,
            max_attempts: config.max_attempts,
            extra_retryable_statuses: config.extra_retryable_statuses.clone(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Only idempotent-in-practice requests are retried. The close call is
    /// a DELETE precisely so that it is never replayed.
    pub fn method_is_retryable(method: &Method) -> bool {
        matches!(*method, Method::GET | Method::PUT | Method::POST)
    }

    /// Classifies a failed attempt. A non-retryable method short-circuits
    /// every failure to [`ErrorClass::NonRetryable`].
    pub fn classify(&self, method: &Method, failure: &AttemptFailure) -> ErrorClass {
        if !Self::method_is_retryable(method) {
            return ErrorClass::NonRetryable;
        }
        match failure {
            AttemptFailure::Network(_) => ErrorClass::TransientNetwork,
            AttemptFailure::Status {
                status,
                retry_after,
            } => match status {
                503 => ErrorClass::ServiceUnavailable {
                    retry_after: *retry_after,
                },
                429 => ErrorClass::RateLimited {
                    retry_after: *retry_after,
                },
                s if self.extra_retryable_statuses.contains(s) => ErrorClass::TransientNetwork,
                _ => ErrorClass::NonRetryable,
            },
        }
    }

    /// Delay before retry number `attempt` (zero-based: the delay after the
    /// first failure is `delay_for(.., 0)`). A server-provided `Retry-After`
    /// wins over the computed backoff.
    pub fn delay_for(&self, class: &ErrorClass, attempt: u32) -> Duration {
        match class {
            ErrorClass::ServiceUnavailable {
                retry_after: Some(d),
            }
            | ErrorClass::RateLimited {
                retry_after: Some(d),
            } => *d,
            _ => self.exponential_delay(attempt),
        }
    }

    fn exponential_delay(&self, attempt: u32) -> Duration {
        let scaled = self
            .base_delay
            .saturating_mul(self.backoff_factor.saturating_pow(attempt));
        scaled.min(self.max_delay)
    }
}
