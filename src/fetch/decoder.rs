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

//! Column batch decoding: optional LZ4-frame decompression followed by
//! Arrow IPC stream parsing.
//!
//! Decoding happens once per chunk, after a successful download. Batches
//! hold Arc-backed column buffers, so cloning a `RecordBatch` to hand rows
//! out is cheap and rows are read without copying the decoded buffers
//! again. Malformed bytes are terminal: the same bytes would fail the same
//! way, so decode failures are never retried.

use std::io::{Cursor, Read};

use arrow_array::RecordBatch;
use arrow_ipc::reader::StreamReader;
use lz4_flex::frame::FrameDecoder;
use tracing::debug;

use crate::error::Result;
use crate::protocol::CompressionCodec;

/// Decodes one chunk's bytes into its record batches.
pub fn decode_chunk(
    chunk_index: i64,
    data: &[u8],
    codec: CompressionCodec,
) -> Result<Vec<RecordBatch>> {
    let decompressed = match codec {
        CompressionCodec::None => data.to_vec(),
        CompressionCodec::Lz4Frame => {
            let mut decoder = FrameDecoder::new(data);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out).map_err(|e| {
                crate::Error::decode(chunk_index, format!("LZ4 decompression failed: {e}"))
            })?;
            out
        }
    };

    let reader = StreamReader::try_new(Cursor::new(&decompressed), None).map_err(|e| {
        crate::Error::decode(chunk_index, format!("invalid Arrow IPC stream: {e}"))
    })?;

    let mut batches = Vec::new();
    for batch in reader {
        let batch = batch.map_err(|e| {
            crate::Error::decode(chunk_index, format!("failed to read record batch: {e}"))
        })?;
        batches.push(batch);
    }

    debug!(
        "decoded chunk {}: {} bytes into {} batches",
        chunk_index,
        data.len(),
        batches.len()
    );
    Ok(batches)
}
