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

//! Per-chunk state machine.
//!
//! Every chunk moves through
//! `Pending -> Downloading -> Downloaded -> Processing -> Ready`, with
//! `DownloadRetry` looping back to `Downloading` after a link refresh, and
//! the terminal states `DownloadFailed`, `ProcessingFailed`, `Cancelled`
//! and `Released`. All state (including the decoded batches) lives behind
//! one mutex; transitions are only made while holding it, so torn
//! transitions are impossible by construction.
//!
//! `release` is idempotent: the first call frees the decoded batches and
//! returns `true`, every later call is a no-op returning `false`. Batches
//! are unreachable after release; a consumer holding a stale handle gets an
//! error, never freed data.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use arrow_array::RecordBatch;

use crate::error::{Error, Result};
use crate::protocol::ChunkDescriptor;

/// Lifecycle state of one chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkState {
    Pending,
    Downloading,
    Downloaded,
    Processing,
    Ready,
    /// Transient download failure; the worker will refresh the link and
    /// re-enter `Downloading`.
    DownloadRetry,
    DownloadFailed(String),
    ProcessingFailed(String),
    Cancelled,
    Released,
}

#[derive(Debug)]
struct ChunkInner {
    descriptor: ChunkDescriptor,
    state: ChunkState,
    batches: Vec<RecordBatch>,
}

/// One result chunk: descriptor, lifecycle state and (once ready) the
/// decoded batches.
#[derive(Debug)]
pub struct ResultChunk {
    chunk_index: i64,
    inner: Mutex<ChunkInner>,
}

impl ResultChunk {
    pub fn new(descriptor: ChunkDescriptor) -> Self {
        Self {
            chunk_index: descriptor.chunk_index,
            inner: Mutex::new(ChunkInner {
                descriptor,
                state: ChunkState::Pending,
                batches: Vec::new(),
            }),
        }
    }

    pub fn chunk_index(&self) -> i64 {
        self.chunk_index
    }

    fn lock(&self) -> MutexGuard<'_, ChunkInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> ChunkState {
        self.lock().state.clone()
    }

    pub fn descriptor(&self) -> ChunkDescriptor {
        self.lock().descriptor.clone()
    }

    /// Replaces the descriptor after link resolution.
    pub(crate) fn set_descriptor(&self, descriptor: ChunkDescriptor) {
        self.lock().descriptor = descriptor;
    }

    /// Whether this chunk needs link resolution before download.
    pub fn needs_link(&self, margin: Duration) -> bool {
        !self.lock().descriptor.has_usable_link(margin)
    }

    /// `Pending`/`DownloadRetry` -> `Downloading`. Returns `false` if the
    /// chunk is no longer downloadable (cancelled or released).
    pub(crate) fn begin_download(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            ChunkState::Pending | ChunkState::DownloadRetry => {
                inner.state = ChunkState::Downloading;
                true
            }
            _ => false,
        }
    }

    /// `Downloading` -> `Downloaded`: transfer finished, bytes in hand.
    pub(crate) fn mark_downloaded(&self) -> bool {
        let mut inner = self.lock();
        if inner.state == ChunkState::Downloading {
            inner.state = ChunkState::Downloaded;
            true
        } else {
            false
        }
    }

    /// `Downloaded` -> `Processing`: decode is about to run.
    pub(crate) fn begin_processing(&self) -> bool {
        let mut inner = self.lock();
        if inner.state == ChunkState::Downloaded {
            inner.state = ChunkState::Processing;
            true
        } else {
            false
        }
    }

    /// `Processing` -> `Ready` with the decoded batches.
    pub(crate) fn complete(&self, batches: Vec<RecordBatch>) -> bool {
        let mut inner = self.lock();
        if inner.state == ChunkState::Processing {
            inner.state = ChunkState::Ready;
            inner.batches = batches;
            true
        } else {
            false
        }
    }

    /// `Downloading` -> `DownloadRetry`: the link will be refreshed and the
    /// download attempted again.
    pub(crate) fn mark_retry(&self) -> bool {
        let mut inner = self.lock();
        if inner.state == ChunkState::Downloading {
            inner.state = ChunkState::DownloadRetry;
            true
        } else {
            false
        }
    }

    pub(crate) fn fail_download(&self, message: impl Into<String>) {
        let mut inner = self.lock();
        if !matches!(inner.state, ChunkState::Released | ChunkState::Cancelled) {
            inner.state = ChunkState::DownloadFailed(message.into());
        }
    }

    /// Decode failures are terminal; the same bytes would fail again.
    pub(crate) fn fail_processing(&self, message: impl Into<String>) {
        let mut inner = self.lock();
        if !matches!(inner.state, ChunkState::Released | ChunkState::Cancelled) {
            inner.state = ChunkState::ProcessingFailed(message.into());
        }
    }

    /// Marks the chunk cancelled and drops any decoded batches.
    pub(crate) fn cancel(&self) {
        let mut inner = self.lock();
        if inner.state != ChunkState::Released {
            inner.state = ChunkState::Cancelled;
            inner.batches = Vec::new();
        }
    }

    /// Frees the chunk's memory. Idempotent: `true` the first time, `false`
    /// on every later call.
    pub fn release(&self) -> bool {
        let mut inner = self.lock();
        if inner.state == ChunkState::Released {
            return false;
        }
        inner.state = ChunkState::Released;
        inner.batches = Vec::new();
        true
    }

    /// The decoded batches, available only while `Ready`. Clones are
    /// Arc-backed column handles, not buffer copies.
    pub fn batches(&self) -> Result<Vec<RecordBatch>> {
        let inner = self.lock();
        match &inner.state {
            ChunkState::Ready => Ok(inner.batches.clone()),
            other => Err(Error::invalid_state(format!(
                "chunk {} batches requested in state {other:?}",
                self.chunk_index
            ))),
        }
    }

    /// Maps a terminal failure state to the error a consumer should see,
    /// if the chunk is in one.
    pub fn failure(&self) -> Option<Error> {
        match self.state() {
            ChunkState::DownloadFailed(message) => Some(Error::transport(format!(
                "chunk {} download failed: {message}",
                self.chunk_index
            ))),
            ChunkState::ProcessingFailed(message) => {
                Some(Error::decode(self.chunk_index, message))
            }
            ChunkState::Cancelled => Some(Error::Cancelled),
            _ => None,
        }
    }
}
