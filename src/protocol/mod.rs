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

//! Protocol-neutral statement and result model.
//!
//! Both backend clients (REST in [`rest`], binary RPC in [`rpc`]) normalize
//! their wire shapes into the types here, so everything above the I/O
//! boundary is protocol-agnostic.

pub mod rest;
pub mod rpc;

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Lifecycle state of a submitted statement, as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
    Closed,
}

impl StatementState {
    /// Whether the server will not change this state anymore.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StatementState::Succeeded
                | StatementState::Failed
                | StatementState::Canceled
                | StatementState::Closed
        )
    }
}

/// Server-reported error details attached to a failed statement.
#[derive(Debug, Clone, Default)]
pub struct ServerError {
    pub code: Option<String>,
    pub message: Option<String>,
}

/// Statement status: lifecycle state plus error details when failed.
#[derive(Debug, Clone)]
pub struct StatementStatus {
    pub state: StatementState,
    pub error: Option<ServerError>,
}

impl StatementStatus {
    pub fn new(state: StatementState) -> Self {
        Self { state, error: None }
    }
}

/// One column in the result schema.
#[derive(Debug, Clone)]
pub struct ColumnSchema {
    pub name: String,
    pub type_name: String,
    pub position: i32,
}

/// Compression applied to chunk bytes before transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionCodec {
    #[default]
    None,
    Lz4Frame,
}

impl CompressionCodec {
    /// Maps the manifest's compression label. Unknown labels are rejected
    /// rather than guessed at.
    pub fn from_label(label: Option<&str>) -> crate::Result<Self> {
        match label {
            None | Some("NONE") | Some("") => Ok(CompressionCodec::None),
            Some("LZ4_FRAME") => Ok(CompressionCodec::Lz4Frame),
            Some(other) => Err(crate::Error::protocol(format!(
                "unsupported result compression: {other}"
            ))),
        }
    }
}

/// Summary of a statement's result set.
#[derive(Debug, Clone)]
pub struct ResultManifest {
    pub columns: Vec<ColumnSchema>,
    pub total_row_count: i64,
    pub total_chunk_count: i64,
    pub compression: CompressionCodec,
}

/// A time-limited download link for one chunk.
#[derive(Debug, Clone)]
pub struct ChunkLink {
    pub url: String,
    pub expiry: DateTime<Utc>,
    /// Headers the storage service requires on the download request. When
    /// present, these replace the session's own headers.
    pub headers: HashMap<String, String>,
}

impl ChunkLink {
    /// Whether the link is no longer safe to use: expired, or within
    /// `margin` of expiring.
    pub fn is_expiring(&self, margin: Duration) -> bool {
        let margin = chrono::Duration::from_std(margin).unwrap_or(chrono::Duration::zero());
        Utc::now() + margin >= self.expiry
    }
}

/// Position, size and (possibly absent or stale) download link for one chunk.
#[derive(Debug, Clone)]
pub struct ChunkDescriptor {
    pub chunk_index: i64,
    pub row_offset: i64,
    pub row_count: i64,
    pub byte_count: i64,
    pub link: Option<ChunkLink>,
}

impl ChunkDescriptor {
    /// A descriptor known only by index; position and link are filled in by
    /// the first resolution.
    pub fn placeholder(chunk_index: i64) -> Self {
        Self {
            chunk_index,
            row_offset: -1,
            row_count: 0,
            byte_count: 0,
            link: None,
        }
    }

    /// Whether this descriptor carries a link that is still usable.
    pub fn has_usable_link(&self, margin: Duration) -> bool {
        match &self.link {
            Some(link) => !link.is_expiring(margin),
            None => false,
        }
    }
}

/// Opaque handle to a running operation on the binary RPC backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcOperationHandle {
    pub guid: [u8; 16],
    pub secret: [u8; 16],
}

/// Server-issued handle identifying a submitted statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementHandle {
    /// REST backend: a string statement id.
    Rest { statement_id: String },
    /// Binary RPC backend: an operation guid plus secret.
    BinaryRpc { operation: RpcOperationHandle },
}

impl StatementHandle {
    /// A loggable identifier for this statement.
    pub fn id(&self) -> String {
        match self {
            StatementHandle::Rest { statement_id } => statement_id.clone(),
            StatementHandle::BinaryRpc { operation } => operation
                .guid
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<String>(),
        }
    }
}

/// Normalized response to a submit or poll call: the current status plus any
/// result material the server attached.
#[derive(Debug, Clone)]
pub struct StatementUpdate {
    pub status: StatementStatus,
    pub manifest: Option<ResultManifest>,
    /// Chunk descriptors the server volunteered with this response.
    pub chunks: Vec<ChunkDescriptor>,
    /// Inline Arrow IPC bytes for small result sets.
    pub inline_data: Option<Vec<u8>>,
}

impl StatementUpdate {
    pub fn from_status(status: StatementStatus) -> Self {
        Self {
            status,
            manifest: None,
            chunks: Vec::new(),
            inline_data: None,
        }
    }

    /// Fills in result material missing from this update using an earlier
    /// observation of the same statement. Poll responses on some backends
    /// carry status only; the manifest, links and inline bytes volunteered
    /// at submit time must survive to the terminal update.
    pub fn merged_with(mut self, earlier: StatementUpdate) -> Self {
        if self.manifest.is_none() {
            self.manifest = earlier.manifest;
        }
        if self.chunks.is_empty() {
            self.chunks = earlier.chunks;
        }
        if self.inline_data.is_none() {
            self.inline_data = earlier.inline_data;
        }
        self
    }
}

/// Caller-supplied execution options forwarded to the backend.
#[derive(Debug, Clone, Default)]
pub struct StatementOptions {
    pub catalog: Option<String>,
    pub schema: Option<String>,
    pub row_limit: Option<i64>,
}

/// One page of chunk descriptors from a link-fetch call, with the
/// continuation position for the next page if more remain.
#[derive(Debug, Clone, Default)]
pub struct ChunkLinkBatch {
    pub descriptors: Vec<ChunkDescriptor>,
    /// REST continuation: index of the next chunk to request.
    pub next_chunk_index: Option<i64>,
    /// Binary RPC continuation: row offset of the next fetch.
    pub next_row_offset: Option<i64>,
}
