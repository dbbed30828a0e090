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

//! Chunk link resolution.
//!
//! Download links are time-limited, so a chunk's link may be missing (the
//! server only volunteered the first few) or stale by the time its download
//! starts. [`ChunkLinkResolver`] owns the descriptor cache: resolving a
//! chunk that already has a usable link is a no-op; otherwise one
//! link-fetch call runs against the backend and every descriptor it returns
//! is cached, so one server roundtrip typically satisfies many chunks.
//!
//! Link freshness uses a safety margin: a link within `margin` of its
//! expiry is treated as already expired, so a download never starts on a
//! link that would lapse mid-transfer.

use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::{ChunkDescriptor, ChunkLinkBatch};

/// Backend operation that fetches download links for a statement's chunks.
///
/// `start_chunk_index` drives the REST continuation; `start_row_offset`
/// drives the binary RPC one. Each implementation uses whichever its
/// protocol understands.
#[async_trait]
pub trait LinkSource: Send + Sync + Debug {
    async fn fetch_links(
        &self,
        start_chunk_index: i64,
        start_row_offset: i64,
    ) -> Result<ChunkLinkBatch>;
}

/// Caching resolver mapping chunk index to a fresh download link.
#[derive(Debug)]
pub struct ChunkLinkResolver {
    source: Arc<dyn LinkSource>,
    cache: DashMap<i64, ChunkDescriptor>,
    expiry_margin: Duration,
    /// Row offset to continue from when the requested chunk's position is
    /// not yet known (binary RPC continuation).
    next_row_offset: AtomicI64,
    /// Serializes server fetches so concurrent workers don't duplicate them.
    fetch_lock: tokio::sync::Mutex<()>,
}

impl ChunkLinkResolver {
    pub fn new(
        source: Arc<dyn LinkSource>,
        initial: Vec<ChunkDescriptor>,
        expiry_margin: Duration,
    ) -> Self {
        let resolver = Self {
            source,
            cache: DashMap::new(),
            expiry_margin,
            next_row_offset: AtomicI64::new(0),
            fetch_lock: tokio::sync::Mutex::new(()),
        };
        resolver.cache_batch(initial);
        resolver
    }

    /// The cached descriptor for a chunk, fresh or not.
    pub fn peek(&self, chunk_index: i64) -> Option<ChunkDescriptor> {
        self.cache.get(&chunk_index).map(|d| d.clone())
    }

    /// Returns a descriptor with a usable link for `chunk_index`, fetching
    /// from the backend only when the cached link is missing or expiring.
    pub async fn resolve(&self, chunk_index: i64) -> Result<ChunkDescriptor> {
        if let Some(descriptor) = self.fresh(chunk_index) {
            return Ok(descriptor);
        }
        self.fetch(chunk_index, false).await
    }

    /// Fetches a new link for `chunk_index` even if the cached one still
    /// looks fresh (used after the storage service rejected it).
    pub async fn refresh(&self, chunk_index: i64) -> Result<ChunkDescriptor> {
        self.fetch(chunk_index, true).await
    }

    fn fresh(&self, chunk_index: i64) -> Option<ChunkDescriptor> {
        self.cache
            .get(&chunk_index)
            .filter(|d| d.has_usable_link(self.expiry_margin))
            .map(|d| d.clone())
    }

    async fn fetch(&self, chunk_index: i64, forced: bool) -> Result<ChunkDescriptor> {
        let _guard = self.fetch_lock.lock().await;

        // Another worker may have fetched this while we waited
        if !forced {
            if let Some(descriptor) = self.fresh(chunk_index) {
                return Ok(descriptor);
            }
        }

        let row_offset = self
            .cache
            .get(&chunk_index)
            .map(|d| d.row_offset)
            .filter(|offset| *offset >= 0)
            .unwrap_or_else(|| self.next_row_offset.load(Ordering::Acquire));

        debug!(
            "fetching links from chunk {} (row offset {})",
            chunk_index, row_offset
        );
        let batch = self.source.fetch_links(chunk_index, row_offset).await?;
        if let Some(next) = batch.next_row_offset {
            self.next_row_offset.store(next, Ordering::Release);
        }
        self.cache_batch(batch.descriptors);

        self.fresh(chunk_index).ok_or_else(|| Error::LinkExpired {
            chunk_index,
            message: "server returned no usable link for this chunk".to_string(),
        })
    }

    fn cache_batch(&self, descriptors: Vec<ChunkDescriptor>) {
        for descriptor in descriptors {
            if descriptor.row_offset >= 0 {
                let end = descriptor.row_offset + descriptor.row_count;
                self.next_row_offset.fetch_max(end, Ordering::AcqRel);
            }
            self.cache.insert(descriptor.chunk_index, descriptor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChunkLink;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn linked(index: i64, ttl_secs: i64) -> ChunkDescriptor {
        ChunkDescriptor {
            chunk_index: index,
            row_offset: index * 100,
            row_count: 100,
            byte_count: 1000,
            link: Some(ChunkLink {
                url: format!("https://storage.example.com/chunk{index}"),
                expiry: Utc::now() + chrono::Duration::seconds(ttl_secs),
                headers: HashMap::new(),
            }),
        }
    }

    #[derive(Debug)]
    struct MockSource {
        calls: AtomicUsize,
        offsets_seen: Mutex<Vec<(i64, i64)>>,
        batches: Mutex<Vec<ChunkLinkBatch>>,
    }

    impl MockSource {
        fn new(batches: Vec<ChunkLinkBatch>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                offsets_seen: Mutex::new(Vec::new()),
                batches: Mutex::new(batches),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LinkSource for MockSource {
        async fn fetch_links(
            &self,
            start_chunk_index: i64,
            start_row_offset: i64,
        ) -> Result<ChunkLinkBatch> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.offsets_seen
                .lock()
                .unwrap()
                .push((start_chunk_index, start_row_offset));
            let mut batches = self.batches.lock().unwrap();
            if batches.is_empty() {
                return Ok(ChunkLinkBatch::default());
            }
            Ok(batches.remove(0))
        }
    }

    const MARGIN: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn fresh_cached_link_short_circuits() {
        let source = MockSource::new(vec![]);
        let resolver = ChunkLinkResolver::new(source.clone(), vec![linked(0, 3600)], MARGIN);

        let descriptor = resolver.resolve(0).await.unwrap();
        assert_eq!(descriptor.chunk_index, 0);
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn missing_link_triggers_one_fetch_and_caches_all() {
        let source = MockSource::new(vec![ChunkLinkBatch {
            descriptors: vec![linked(1, 3600), linked(2, 3600), linked(3, 3600)],
            next_chunk_index: None,
            next_row_offset: Some(400),
        }]);
        let resolver = ChunkLinkResolver::new(source.clone(), vec![linked(0, 3600)], MARGIN);

        let descriptor = resolver.resolve(1).await.unwrap();
        assert_eq!(descriptor.chunk_index, 1);
        assert_eq!(source.calls(), 1);

        // 2 and 3 were cached opportunistically
        resolver.resolve(2).await.unwrap();
        resolver.resolve(3).await.unwrap();
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn expiring_link_is_re_resolved() {
        // Inside the 30s margin even though not strictly expired
        let source = MockSource::new(vec![ChunkLinkBatch {
            descriptors: vec![linked(0, 3600)],
            ..Default::default()
        }]);
        let resolver = ChunkLinkResolver::new(source.clone(), vec![linked(0, 10)], MARGIN);

        let descriptor = resolver.resolve(0).await.unwrap();
        assert_eq!(source.calls(), 1);
        assert!(descriptor.has_usable_link(MARGIN));
    }

    #[tokio::test]
    async fn refresh_bypasses_fresh_cache() {
        let source = MockSource::new(vec![ChunkLinkBatch {
            descriptors: vec![linked(0, 3600)],
            ..Default::default()
        }]);
        let resolver = ChunkLinkResolver::new(source.clone(), vec![linked(0, 3600)], MARGIN);

        resolver.refresh(0).await.unwrap();
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn no_link_for_requested_chunk_is_an_expiry_error() {
        let source = MockSource::new(vec![ChunkLinkBatch::default()]);
        let resolver = ChunkLinkResolver::new(source, vec![], MARGIN);

        let err = resolver.resolve(5).await.unwrap_err();
        assert!(matches!(err, Error::LinkExpired { chunk_index: 5, .. }));
    }

    #[tokio::test]
    async fn row_offset_continuation_tracks_cached_descriptors() {
        let source = MockSource::new(vec![
            ChunkLinkBatch {
                descriptors: vec![linked(1, 3600)],
                ..Default::default()
            },
            ChunkLinkBatch {
                descriptors: vec![linked(2, 3600)],
                ..Default::default()
            },
        ]);
        let resolver = ChunkLinkResolver::new(source.clone(), vec![linked(0, 3600)], MARGIN);

        resolver.resolve(1).await.unwrap();
        resolver.resolve(2).await.unwrap();

        let offsets = source.offsets_seen.lock().unwrap();
        // Chunk 1's position was unknown, so the fetch continued from the
        // highest cached row end (chunk 0 ends at 100); chunk 2 likewise
        // continued from chunk 1's end.
        assert_eq!(offsets[0], (1, 100));
        assert_eq!(offsets[1], (2, 200));
    }
}
