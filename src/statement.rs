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

//! Statement execution.
//!
//! [`StatementExecutor`] drives one protocol-agnostic lifecycle — submit,
//! poll until terminal, cancel, close — over [`Backend`], the tagged union
//! of the two wire protocols. The match on the backend happens only at the
//! I/O boundary; everything else (the poll loop, the deadline, terminal
//! state mapping) is written once.

use std::sync::Arc;

use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::fetch::link::LinkSource;
use crate::protocol::rest::RestClient;
use crate::protocol::rpc::RpcClient;
use crate::protocol::{
    ChunkLinkBatch, StatementHandle, StatementOptions, StatementState, StatementUpdate,
};

/// The two wire protocols a warehouse endpoint may speak.
#[derive(Debug)]
pub enum Backend {
    Rest(RestClient),
    BinaryRpc(RpcClient),
}

impl Backend {
    pub async fn submit(
        &self,
        sql: &str,
        options: &StatementOptions,
    ) -> Result<(StatementHandle, StatementUpdate)> {
        match self {
            Backend::Rest(client) => client.submit(sql, options).await,
            Backend::BinaryRpc(client) => client.submit(sql, options).await,
        }
    }

    pub async fn poll(&self, handle: &StatementHandle) -> Result<StatementUpdate> {
        match (self, handle) {
            (Backend::Rest(client), StatementHandle::Rest { statement_id }) => {
                client.poll(statement_id).await
            }
            (Backend::BinaryRpc(client), StatementHandle::BinaryRpc { operation }) => {
                client.poll(operation).await
            }
            _ => Err(Error::invalid_state(
                "statement handle does not belong to this backend",
            )),
        }
    }

    pub async fn cancel(&self, handle: &StatementHandle) -> Result<()> {
        match (self, handle) {
            (Backend::Rest(client), StatementHandle::Rest { statement_id }) => {
                client.cancel(statement_id).await
            }
            (Backend::BinaryRpc(client), StatementHandle::BinaryRpc { operation }) => {
                client.cancel(operation).await
            }
            _ => Err(Error::invalid_state(
                "statement handle does not belong to this backend",
            )),
        }
    }

    pub async fn close(&self, handle: &StatementHandle) -> Result<()> {
        match (self, handle) {
            (Backend::Rest(client), StatementHandle::Rest { statement_id }) => {
                client.close(statement_id).await
            }
            (Backend::BinaryRpc(client), StatementHandle::BinaryRpc { operation }) => {
                client.close(operation).await
            }
            _ => Err(Error::invalid_state(
                "statement handle does not belong to this backend",
            )),
        }
    }

    pub async fn chunk_links(
        &self,
        handle: &StatementHandle,
        start_chunk_index: i64,
        start_row_offset: i64,
    ) -> Result<ChunkLinkBatch> {
        match (self, handle) {
            (Backend::Rest(client), StatementHandle::Rest { statement_id }) => {
                client.chunk_links(statement_id, start_chunk_index).await
            }
            (Backend::BinaryRpc(client), StatementHandle::BinaryRpc { operation }) => {
                client.fetch_links(operation, start_row_offset).await
            }
            _ => Err(Error::invalid_state(
                "statement handle does not belong to this backend",
            )),
        }
    }
}

/// [`LinkSource`] binding a backend to one statement, so the link resolver
/// stays protocol-agnostic.
#[derive(Debug)]
pub struct StatementLinkSource {
    backend: Arc<Backend>,
    handle: StatementHandle,
}

impl StatementLinkSource {
    pub fn new(backend: Arc<Backend>, handle: StatementHandle) -> Self {
        Self { backend, handle }
    }
}

#[async_trait::async_trait]
impl LinkSource for StatementLinkSource {
    async fn fetch_links(
        &self,
        start_chunk_index: i64,
        start_row_offset: i64,
    ) -> Result<ChunkLinkBatch> {
        self.backend
            .chunk_links(&self.handle, start_chunk_index, start_row_offset)
            .await
    }
}

/// Executes statements and drives them to a terminal state.
#[derive(Debug)]
pub struct StatementExecutor {
    backend: Arc<Backend>,
    config: ConnectionConfig,
    /// External cancellation: when triggered, a server-side cancel is
    /// issued before the cancellation propagates.
    cancel: CancellationToken,
}

impl StatementExecutor {
    pub fn new(backend: Arc<Backend>, config: ConnectionConfig) -> Self {
        Self::with_cancellation(backend, config, CancellationToken::new())
    }

    pub fn with_cancellation(
        backend: Arc<Backend>,
        config: ConnectionConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            backend,
            config,
            cancel,
        }
    }

    pub fn backend(&self) -> Arc<Backend> {
        self.backend.clone()
    }

    /// Submits `sql` and polls until the statement reaches a terminal
    /// state. On success the returned update carries the manifest and any
    /// result material the server attached.
    ///
    /// If the query timeout elapses first, a best-effort server-side cancel
    /// is issued and a timeout error returned; a failing cancel is logged
    /// but never masks the timeout.
    pub async fn execute(
        &self,
        sql: &str,
        options: &StatementOptions,
    ) -> Result<(StatementHandle, StatementUpdate)> {
        let deadline = Instant::now() + self.config.query_timeout;
        let (handle, first) = self.backend.submit(sql, options).await?;
        debug!("statement {} submitted", handle.id());

        match self.wait_until_terminal(&handle, first, deadline).await {
            Ok(update) => Ok((handle, update)),
            Err(e) => Err(e),
        }
    }

    async fn wait_until_terminal(
        &self,
        handle: &StatementHandle,
        first: StatementUpdate,
        deadline: Instant,
    ) -> Result<StatementUpdate> {
        let mut update = first;
        loop {
            if self.check_terminal(handle, &update)? {
                return Ok(update);
            }

            if Instant::now() >= deadline {
                self.cancel_best_effort(handle).await;
                return Err(Error::Timeout {
                    timeout: self.config.query_timeout,
                });
            }
            if self.cancel.is_cancelled() {
                self.cancel_best_effort(handle).await;
                return Err(Error::Cancelled);
            }

            // The submit response was already the first status observation,
            // so every iteration here sleeps before polling again
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.cancel_best_effort(handle).await;
                    return Err(Error::Cancelled);
                }
                _ = sleep(self.config.poll_interval) => {}
            }

            // Status-only poll responses must not drop the result material
            // the submit response carried
            let polled = self.backend.poll(handle).await?;
            update = polled.merged_with(update);
        }
    }

    /// Whether the statement is done; errors map terminal failures.
    fn check_terminal(&self, handle: &StatementHandle, update: &StatementUpdate) -> Result<bool> {
        match update.status.state {
            StatementState::Succeeded => Ok(true),
            // A closed statement that still carries result material is a
            // success whose resources were already scheduled for cleanup
            StatementState::Closed
                if update.manifest.is_some()
                    || !update.chunks.is_empty()
                    || update.inline_data.is_some() =>
            {
                Ok(true)
            }
            StatementState::Failed => {
                let error = update.status.error.clone().unwrap_or_default();
                Err(Error::Execution {
                    statement_id: handle.id(),
                    code: error.code,
                    message: error
                        .message
                        .unwrap_or_else(|| "statement failed".to_string()),
                })
            }
            StatementState::Canceled => Err(Error::Cancelled),
            StatementState::Closed => Err(Error::invalid_state(format!(
                "statement {} was closed before completing",
                handle.id()
            ))),
            StatementState::Pending | StatementState::Running => Ok(false),
        }
    }

    /// Polls the statement's current status once.
    pub async fn poll(&self, handle: &StatementHandle) -> Result<StatementUpdate> {
        self.backend.poll(handle).await
    }

    /// Requests server-side cancellation.
    pub async fn cancel(&self, handle: &StatementHandle) -> Result<()> {
        self.backend.cancel(handle).await
    }

    /// Closes the statement, releasing server-side resources. Best-effort:
    /// server errors are logged and swallowed.
    pub async fn close(&self, handle: &StatementHandle) {
        if let Err(e) = self.backend.close(handle).await {
            warn!("failed to close statement {}: {e}", handle.id());
        }
    }

    async fn cancel_best_effort(&self, handle: &StatementHandle) {
        if let Err(e) = self.backend.cancel(handle).await {
            warn!(
                "failed to cancel statement {} after timeout: {e}",
                handle.id()
            );
        }
    }
}
