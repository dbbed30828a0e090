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

//! Retrying transfer executor.
//!
//! Wraps a [`Transport`] and replays failed requests according to the
//! [`BackoffPolicy`]. Retry state is carried in an explicit [`RetryContext`]
//! per logical operation, never in ambient per-connection state: attempt
//! count, every delay actually slept, and the wall-clock instant of the
//! first retry for each budgeted condition (503 and 429 are tracked
//! separately and never share a budget).

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::{Error, Result};

use super::backoff::{AttemptFailure, BackoffPolicy, ErrorClass};
use super::{TransferRequest, TransferResponse, Transport};

/// Retry state for one logical operation.
#[derive(Debug)]
pub struct RetryContext {
    /// Number of retries performed so far (not counting the first attempt).
    pub attempts: u32,
    /// Every delay that was actually slept, in order.
    pub delays: Vec<Duration>,
    unavailable_since: Option<Instant>,
    rate_limited_since: Option<Instant>,
}

impl RetryContext {
    pub fn new() -> Self {
        Self {
            attempts: 0,
            delays: Vec::new(),
            unavailable_since: None,
            rate_limited_since: None,
        }
    }
}

impl Default for RetryContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Executes transfers with retry.
///
/// Transient network failures (and the configured extra statuses) back off
/// exponentially up to the attempt cap. 503 and 429 responses honor
/// `Retry-After`; they stop at the attempt cap or when their own cumulative
/// wall-clock budget (measured from the first retry of that condition) runs
/// out, whichever triggers first.
#[derive(Debug)]
pub struct TransferRetryExecutor {
    transport: Arc<dyn Transport>,
    policy: BackoffPolicy,
    unavailable_budget: Duration,
    rate_limit_budget: Duration,
}

impl TransferRetryExecutor {
    pub fn new(transport: Arc<dyn Transport>, retry: &RetryConfig) -> Self {
        Self {
            transport,
            policy: BackoffPolicy::new(retry),
            unavailable_budget: retry.unavailable_retry_timeout,
            rate_limit_budget: retry.rate_limit_retry_timeout,
        }
    }

    /// Executes a request with a fresh retry context.
    pub async fn execute(&self, request: &TransferRequest) -> Result<TransferResponse> {
        let mut context = RetryContext::new();
        self.execute_with_context(request, &mut context).await
    }

    /// Executes a request, recording retry state into `context`.
    pub async fn execute_with_context(
        &self,
        request: &TransferRequest,
        context: &mut RetryContext,
    ) -> Result<TransferResponse> {
        loop {
            let (failure, response) = match self.transport.roundtrip(request).await {
                Ok(response) if response.is_success() => {
                    if context.attempts > 0 {
                        debug!(
                            "{} {} succeeded after {} retries",
                            request.method, request.url, context.attempts
                        );
                    }
                    return Ok(response);
                }
                Ok(response) => {
                    let failure = AttemptFailure::Status {
                        status: response.status,
                        retry_after: response.retry_after,
                    };
                    (failure, Some(response))
                }
                Err(e) => (AttemptFailure::Network(e), None),
            };

            let class = self.policy.classify(&request.method, &failure);
            if class == ErrorClass::NonRetryable {
                return Err(terminal_error(&failure, response.as_ref()));
            }

            let now = Instant::now();
            let capped = context.attempts + 1 >= self.policy.max_attempts();
            let exhausted = match &class {
                ErrorClass::TransientNetwork => capped,
                ErrorClass::ServiceUnavailable { .. } => {
                    let since = *context.unavailable_since.get_or_insert(now);
                    capped || now.duration_since(since) >= self.unavailable_budget
                }
                ErrorClass::RateLimited { .. } => {
                    let since = *context.rate_limited_since.get_or_insert(now);
                    capped || now.duration_since(since) >= self.rate_limit_budget
                }
                ErrorClass::NonRetryable => unreachable!(),
            };
            if exhausted {
                warn!(
                    "{} {} giving up after {} retries",
                    request.method, request.url, context.attempts
                );
                return Err(terminal_error(&failure, response.as_ref()));
            }

            let delay = self.policy.delay_for(&class, context.attempts);
            warn!(
                "{} {} failed ({:?}), retry {} in {:?}",
                request.method,
                request.url,
                class,
                context.attempts + 1,
                delay
            );
            context.attempts += 1;
            context.delays.push(delay);
            sleep(delay).await;
        }
    }
}

fn terminal_error(failure: &AttemptFailure, response: Option<&TransferResponse>) -> Error {
    match failure {
        AttemptFailure::Network(e) => Error::transport(e.to_string()),
        AttemptFailure::Status { status, .. } => Error::Http {
            status: *status,
            body: response.map(|r| r.body_text()).unwrap_or_default(),
        },
    }
}
