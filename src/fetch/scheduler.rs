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

//! Bounded-parallel chunk download scheduling with strict in-order delivery.
//!
//! The scheduler keeps a sliding window of at most `window` chunks alive at
//! once, from the consumer's position forward. Each admitted chunk gets its
//! own worker task: resolve the link if needed, download, decode, mark the
//! chunk ready. Workers complete in any order; the consumer only observes
//! chunks strictly by index via [`ChunkDownloadScheduler::advance`], which
//! also releases the previous chunk and admits the next one into the
//! window. A failed chunk surfaces its error on the `advance` call that
//! would have returned it, and on every `advance` after that; chunks
//! before it are still delivered, rows past it are never silently skipped.
//!
//! Waiting uses a shared [`Notify`]: waiters register before re-checking
//! chunk state, so a worker transition between check and sleep cannot be
//! missed. Close cancels the token, cancels every live chunk and wakes all
//! waiters.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::protocol::{ChunkDescriptor, CompressionCodec};
use crate::transfer::{TransferRequest, TransferRetryExecutor};

use super::chunk::{ChunkState, ResultChunk};
use super::decoder::decode_chunk;
use super::link::ChunkLinkResolver;

/// Fetches one chunk's raw bytes from its download link.
#[async_trait]
pub trait ChunkTransfer: Send + Sync + Debug {
    async fn fetch(&self, descriptor: &ChunkDescriptor) -> Result<Bytes>;
}

/// Production [`ChunkTransfer`]: GET against the pre-signed link with the
/// link's own headers, session headers withheld.
#[derive(Debug)]
pub struct HttpChunkTransfer {
    transfer: Arc<TransferRetryExecutor>,
    min_speed_mbps: f64,
}

impl HttpChunkTransfer {
    pub fn new(transfer: Arc<TransferRetryExecutor>, min_speed_mbps: f64) -> Self {
        Self {
            transfer,
            min_speed_mbps,
        }
    }
}

#[async_trait]
impl ChunkTransfer for HttpChunkTransfer {
    async fn fetch(&self, descriptor: &ChunkDescriptor) -> Result<Bytes> {
        let link = descriptor.link.as_ref().ok_or_else(|| {
            Error::invalid_state(format!(
                "chunk {} scheduled for download without a link",
                descriptor.chunk_index
            ))
        })?;

        let mut request = TransferRequest::get(link.url.as_str()).unauthenticated();
        for (name, value) in &link.headers {
            request = request.header(name.clone(), value.clone());
        }

        let started = std::time::Instant::now();
        let response = self.transfer.execute(&request).await?;
        let elapsed = started.elapsed();

        let size_mb = response.body.len() as f64 / (1024.0 * 1024.0);
        let speed = size_mb / elapsed.as_secs_f64().max(1e-9);
        debug!(
            "downloaded chunk {}: {:.2} MB in {:?} ({:.2} MB/s)",
            descriptor.chunk_index, size_mb, elapsed, speed
        );
        if speed < self.min_speed_mbps {
            warn!(
                "slow download for chunk {}: {:.3} MB/s (threshold {:.3})",
                descriptor.chunk_index, speed, self.min_speed_mbps
            );
        }

        Ok(response.body)
    }
}

/// Schedules chunk downloads and hands chunks to the consumer in index
/// order.
#[derive(Debug)]
pub struct ChunkDownloadScheduler {
    chunks: Arc<DashMap<i64, Arc<ResultChunk>>>,
    resolver: Arc<ChunkLinkResolver>,
    transfer: Arc<dyn ChunkTransfer>,
    codec: CompressionCodec,
    total_chunks: i64,
    window: usize,
    expiry_margin: Duration,
    refresh_limit: u32,
    /// Index of the chunk the consumer currently holds; -1 before the
    /// first advance.
    cursor: i64,
    state_changed: Arc<Notify>,
    cancel: CancellationToken,
}

impl ChunkDownloadScheduler {
    pub fn new(
        resolver: Arc<ChunkLinkResolver>,
        transfer: Arc<dyn ChunkTransfer>,
        codec: CompressionCodec,
        total_chunks: i64,
        config: &ConnectionConfig,
    ) -> Self {
        let scheduler = Self {
            chunks: Arc::new(DashMap::new()),
            resolver,
            transfer,
            codec,
            total_chunks,
            window: config.max_parallel_downloads.max(1),
            expiry_margin: config.link_expiry_margin,
            refresh_limit: config.link_refresh_limit,
            cursor: -1,
            state_changed: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
        };
        // A zero-chunk result never starts a download
        let initial = (scheduler.window as i64).min(total_chunks);
        for index in 0..initial {
            scheduler.admit(index);
        }
        scheduler
    }

    pub fn total_chunks(&self) -> i64 {
        self.total_chunks
    }

    /// Whether `advance` can still yield another chunk.
    pub fn has_next(&self) -> bool {
        self.cursor + 1 < self.total_chunks
    }

    /// Moves to the next chunk: releases the current one, admits a new one
    /// into the window, then waits until the next chunk is ready. Returns
    /// `Ok(false)` when the result set is exhausted.
    ///
    /// Once a chunk has failed, every subsequent call returns that failure
    /// again; the stream never resumes past a gap.
    pub async fn advance(&mut self) -> Result<bool> {
        if self.cursor >= 0 {
            let failed = self
                .chunks
                .get(&self.cursor)
                .and_then(|entry| entry.failure());
            if let Some(err) = failed {
                return Err(err);
            }
            if let Some((_, previous)) = self.chunks.remove(&self.cursor) {
                previous.release();
            }
            let next_admit = self.cursor + self.window as i64;
            if next_admit < self.total_chunks {
                self.admit(next_admit);
            }
        }

        self.cursor += 1;
        if self.cursor >= self.total_chunks {
            return Ok(false);
        }
        self.wait_ready(self.cursor).await?;
        Ok(true)
    }

    /// The chunk at the consumer's position. Only valid after an `advance`
    /// that returned `true`.
    pub fn current(&self) -> Result<Arc<ResultChunk>> {
        self.chunks
            .get(&self.cursor)
            .map(|entry| entry.clone())
            .ok_or_else(|| {
                Error::invalid_state(format!("no chunk at cursor {}", self.cursor))
            })
    }

    /// Cancels in-flight downloads, releases every held chunk and wakes any
    /// waiter with a cancellation error.
    pub fn close(&mut self) {
        self.cancel.cancel();
        for entry in self.chunks.iter() {
            entry.value().cancel();
            entry.value().release();
        }
        self.chunks.clear();
        self.state_changed.notify_waiters();
    }

    fn admit(&self, index: i64) {
        let descriptor = self
            .resolver
            .peek(index)
            .unwrap_or_else(|| ChunkDescriptor::placeholder(index));
        let chunk = Arc::new(ResultChunk::new(descriptor));
        self.chunks.insert(index, chunk.clone());
        debug!("admitted chunk {} into the download window", index);

        let resolver = self.resolver.clone();
        let transfer = self.transfer.clone();
        let codec = self.codec;
        let expiry_margin = self.expiry_margin;
        let refresh_limit = self.refresh_limit;
        let notify = self.state_changed.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            run_download(
                chunk,
                resolver,
                transfer,
                codec,
                expiry_margin,
                refresh_limit,
                cancel,
            )
            .await;
            notify.notify_waiters();
        });
    }

    async fn wait_ready(&self, index: i64) -> Result<()> {
        loop {
            // Register before checking state so a transition between the
            // check and the await is not lost
            let notified = self.state_changed.notified();

            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let chunk = self
                .chunks
                .get(&index)
                .map(|entry| entry.clone())
                .ok_or(Error::Cancelled)?;
            match chunk.state() {
                ChunkState::Ready => return Ok(()),
                ChunkState::DownloadFailed(_)
                | ChunkState::ProcessingFailed(_)
                | ChunkState::Cancelled => {
                    return Err(chunk.failure().unwrap_or(Error::Cancelled));
                }
                _ => {}
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                _ = notified => {}
            }
        }
    }
}

impl Drop for ChunkDownloadScheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_download(
    chunk: Arc<ResultChunk>,
    resolver: Arc<ChunkLinkResolver>,
    transfer: Arc<dyn ChunkTransfer>,
    codec: CompressionCodec,
    expiry_margin: Duration,
    refresh_limit: u32,
    cancel: CancellationToken,
) {
    let index = chunk.chunk_index();
    let mut refreshes = 0u32;

    loop {
        // Resolution happens before the transfer, never after a failed one
        if chunk.needs_link(expiry_margin) {
            let resolved = tokio::select! {
                _ = cancel.cancelled() => {
                    chunk.cancel();
                    return;
                }
                resolved = resolver.resolve(index) => resolved,
            };
            match resolved {
                Ok(descriptor) => chunk.set_descriptor(descriptor),
                Err(e) => {
                    chunk.fail_download(e.to_string());
                    return;
                }
            }
        }

        if !chunk.begin_download() {
            return;
        }

        let descriptor = chunk.descriptor();
        let fetched = tokio::select! {
            _ = cancel.cancelled() => {
                chunk.cancel();
                return;
            }
            fetched = transfer.fetch(&descriptor) => fetched,
        };

        match fetched {
            Ok(bytes) => {
                if !chunk.mark_downloaded() || !chunk.begin_processing() {
                    return;
                }
                match decode_chunk(index, &bytes, codec) {
                    Ok(batches) => {
                        chunk.complete(batches);
                    }
                    Err(e) => {
                        let message = match e {
                            Error::Decode { message, .. } => message,
                            other => other.to_string(),
                        };
                        chunk.fail_processing(message);
                    }
                }
                return;
            }
            Err(e) => {
                // Storage rejecting the pre-signed link means it lapsed
                // between resolution and use: refresh and retry
                let link_rejected = matches!(e, Error::Http { status: 401 | 403, .. });
                if link_rejected && refreshes < refresh_limit {
                    refreshes += 1;
                    warn!(
                        "chunk {} link rejected by storage, refreshing (attempt {})",
                        index, refreshes
                    );
                    if !chunk.mark_retry() {
                        return;
                    }
                    match resolver.refresh(index).await {
                        Ok(descriptor) => {
                            chunk.set_descriptor(descriptor);
                            continue;
                        }
                        Err(refresh_err) => {
                            chunk.fail_download(refresh_err.to_string());
                            return;
                        }
                    }
                }
                chunk.fail_download(e.to_string());
                return;
            }
        }
    }
}
