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

//! Chunked result fetching: link resolution, bounded-parallel downloads,
//! decode, and in-order delivery.

pub mod chunk;
pub mod decoder;
pub mod link;
pub mod scheduler;

pub use chunk::{ChunkState, ResultChunk};
pub use link::{ChunkLinkResolver, LinkSource};
pub use scheduler::{ChunkDownloadScheduler, ChunkTransfer, HttpChunkTransfer};
