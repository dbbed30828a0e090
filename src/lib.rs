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

//! Async client for SQL warehouse statement execution with chunked Arrow
//! result streaming.
//!
//! A statement is submitted over one of two wire protocols (REST/JSON or a
//! legacy binary RPC), polled to a terminal state, and its result consumed
//! as Arrow record batches. Large results arrive as a manifest of
//! time-limited external links downloaded in bounded parallel and
//! delivered strictly in chunk order; small results arrive inline.
//!
//! ```no_run
//! use std::sync::Arc;
//! use lakestream::{
//!     Backend, ConnectionConfig, HttpTransport, ResultStream, RestClient,
//!     StatementExecutor, StatementOptions, TransferRetryExecutor,
//! };
//!
//! # async fn run() -> lakestream::Result<()> {
//! let config = ConnectionConfig::default();
//! let transport = HttpTransport::shared(
//!     &config.http,
//!     vec![("Authorization".into(), "Bearer <token>".into())],
//! )?;
//! let transfer = Arc::new(TransferRetryExecutor::new(transport, &config.retry));
//! let backend = Arc::new(Backend::Rest(RestClient::new(
//!     transfer.clone(),
//!     "https://warehouse.example.com",
//!     "warehouse-id",
//! )));
//!
//! let executor = StatementExecutor::new(backend.clone(), config.clone());
//! let (handle, update) = executor
//!     .execute("SELECT * FROM events", &StatementOptions::default())
//!     .await?;
//!
//! let mut stream = ResultStream::build(backend, &handle, update, transfer, &config)?;
//! while let Some(batch) = stream.next_batch().await? {
//!     println!("{} rows", batch.num_rows());
//! }
//! executor.close(&handle).await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod fetch;
pub mod logging;
pub mod protocol;
pub mod result;
pub mod statement;
pub mod transfer;

pub use config::{ConnectionConfig, HttpConfig, RetryConfig};
pub use error::{Error, Result};
pub use fetch::{
    ChunkDownloadScheduler, ChunkLinkResolver, ChunkState, ChunkTransfer, HttpChunkTransfer,
    LinkSource, ResultChunk,
};
pub use logging::{init_logging, LogConfig};
pub use protocol::rest::RestClient;
pub use protocol::rpc::RpcClient;
pub use protocol::{
    ChunkDescriptor, ChunkLink, ChunkLinkBatch, ColumnSchema, CompressionCodec, ResultManifest,
    RpcOperationHandle, ServerError, StatementHandle, StatementOptions, StatementState,
    StatementStatus, StatementUpdate,
};
pub use result::{ResultStream, RowCursor};
pub use statement::{Backend, StatementExecutor, StatementLinkSource};
pub use transfer::backoff::{BackoffPolicy, ErrorClass};
pub use transfer::retry::{RetryContext, TransferRetryExecutor};
pub use transfer::{HttpTransport, TransferRequest, TransferResponse, Transport, TransportError};
