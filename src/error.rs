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

//! Error types for the lakestream client.
//!
//! The taxonomy mirrors how failures behave, not where they occur:
//! - [`Error::Transport`] and [`Error::Http`] — transient transport failures,
//!   normally absorbed by the retry executor and only surfaced once retry
//!   budgets are exhausted.
//! - [`Error::Execution`] — the server reported a terminal failure for a
//!   statement; carries the server's error code and message.
//! - [`Error::Decode`] — malformed chunk bytes; terminal, never retried by
//!   re-fetching the same bytes.
//! - [`Error::LinkExpired`] — a download link's usable window passed and
//!   re-resolution failed.
//! - [`Error::Timeout`] — a client-side deadline was exceeded (always
//!   accompanied by a best-effort server-side cancel).

use std::time::Duration;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by statement execution and result streaming.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Network-level failure (connect, reset, timeout) after retries were
    /// exhausted or the operation was not retry-eligible.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// The server answered with a non-success HTTP status that is not
    /// retryable (or whose retry budget was exhausted).
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// The server reported a terminal non-success status for a statement.
    #[error("statement {statement_id} failed ({}): {message}", code.as_deref().unwrap_or("UNKNOWN"))]
    Execution {
        statement_id: String,
        code: Option<String>,
        message: String,
    },

    /// Chunk bytes could not be decompressed or parsed.
    #[error("failed to decode chunk {chunk_index}: {message}")]
    Decode { chunk_index: i64, message: String },

    /// A chunk's download link expired and could not be refreshed.
    #[error("download link for chunk {chunk_index} expired: {message}")]
    LinkExpired { chunk_index: i64, message: String },

    /// The query timeout elapsed before the statement reached a terminal
    /// state. A server-side cancel has already been attempted.
    #[error("query timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// The operation was cancelled (statement cancel, scheduler close, or
    /// an external cancellation request).
    #[error("operation cancelled")]
    Cancelled,

    /// A response could not be parsed into the expected wire shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An operation was attempted in a state that does not permit it.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    pub(crate) fn transport(message: impl Into<String>) -> Self {
        Error::Transport {
            message: message.into(),
        }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol(message.into())
    }

    pub(crate) fn invalid_state(message: impl Into<String>) -> Self {
        Error::InvalidState(message.into())
    }

    pub(crate) fn decode(chunk_index: i64, message: impl Into<String>) -> Self {
        Error::Decode {
            chunk_index,
            message: message.into(),
        }
    }

    /// Whether this error is a client-side cancellation (as opposed to a
    /// server-reported or transport failure).
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
