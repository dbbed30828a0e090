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

//! Result consumption: batch stream and row cursor.
//!
//! A terminal statement yields one of three stream shapes:
//! - **chunked** — external links downloaded through the scheduler,
//!   delivered strictly in chunk order;
//! - **inline** — small results embedded in the submit/poll response,
//!   decoded eagerly;
//! - **empty** — a successful statement with no result data, which still
//!   exposes its manifest-derived schema.

use std::collections::VecDeque;
use std::sync::Arc;

use arrow_array::{ArrayRef, RecordBatch};
use arrow_schema::{DataType, Field, Schema, SchemaRef, TimeUnit};

use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::fetch::{ChunkDownloadScheduler, ChunkLinkResolver, HttpChunkTransfer};
use crate::protocol::{ResultManifest, StatementHandle, StatementUpdate};
use crate::statement::{Backend, StatementLinkSource};
use crate::transfer::TransferRetryExecutor;

/// Maps a warehouse type name to the Arrow type used when only the
/// manifest schema is available. Unrecognized names fall back to Utf8.
fn map_column_type(type_name: &str) -> DataType {
    match type_name.to_ascii_uppercase().as_str() {
        "BOOLEAN" => DataType::Boolean,
        "BYTE" | "TINYINT" => DataType::Int8,
        "SHORT" | "SMALLINT" => DataType::Int16,
        "INT" | "INTEGER" => DataType::Int32,
        "LONG" | "BIGINT" => DataType::Int64,
        "FLOAT" | "REAL" => DataType::Float32,
        "DOUBLE" => DataType::Float64,
        "DATE" => DataType::Date32,
        "TIMESTAMP" | "TIMESTAMP_NTZ" => DataType::Timestamp(TimeUnit::Microsecond, None),
        "BINARY" => DataType::Binary,
        _ => DataType::Utf8,
    }
}

fn manifest_schema(manifest: &ResultManifest) -> SchemaRef {
    let mut columns: Vec<_> = manifest.columns.iter().collect();
    columns.sort_by_key(|c| c.position);
    let fields: Vec<Field> = columns
        .iter()
        .map(|c| Field::new(&c.name, map_column_type(&c.type_name), true))
        .collect();
    Arc::new(Schema::new(fields))
}

#[derive(Debug)]
enum StreamInner {
    Chunked {
        scheduler: ChunkDownloadScheduler,
        buffer: VecDeque<RecordBatch>,
    },
    Inline {
        batches: VecDeque<RecordBatch>,
    },
    Empty,
}

/// An in-order stream of record batches for one statement's result.
#[derive(Debug)]
pub struct ResultStream {
    schema: SchemaRef,
    inner: StreamInner,
}

impl ResultStream {
    /// Builds the stream for a terminal statement from whatever result
    /// material the server attached.
    pub fn build(
        backend: Arc<Backend>,
        handle: &StatementHandle,
        update: StatementUpdate,
        transfer: Arc<TransferRetryExecutor>,
        config: &ConnectionConfig,
    ) -> Result<Self> {
        let manifest = update.manifest.as_ref();
        let total_chunks = manifest.map(|m| m.total_chunk_count).unwrap_or(0);
        let codec = manifest.map(|m| m.compression).unwrap_or_default();

        if total_chunks > 0 || !update.chunks.is_empty() {
            let total = total_chunks.max(update.chunks.len() as i64);
            let schema = manifest
                .map(manifest_schema)
                .unwrap_or_else(|| Arc::new(Schema::empty()));
            let source = Arc::new(StatementLinkSource::new(backend, handle.clone()));
            let resolver = Arc::new(ChunkLinkResolver::new(
                source,
                update.chunks,
                config.link_expiry_margin,
            ));
            let downloads = Arc::new(HttpChunkTransfer::new(
                transfer,
                config.min_download_speed_mbps,
            ));
            let scheduler =
                ChunkDownloadScheduler::new(resolver, downloads, codec, total, config);
            return Ok(Self::chunked(schema, scheduler));
        }

        if let Some(data) = update.inline_data {
            let batches = crate::fetch::decoder::decode_chunk(0, &data, codec)?;
            let schema = match (manifest, batches.first()) {
                (Some(m), _) => manifest_schema(m),
                (None, Some(batch)) => batch.schema(),
                (None, None) => Arc::new(Schema::empty()),
            };
            return Ok(Self::inline(schema, batches));
        }

        let schema = manifest
            .map(manifest_schema)
            .unwrap_or_else(|| Arc::new(Schema::empty()));
        Ok(Self::empty(schema))
    }

    pub(crate) fn chunked(schema: SchemaRef, scheduler: ChunkDownloadScheduler) -> Self {
        Self {
            schema,
            inner: StreamInner::Chunked {
                scheduler,
                buffer: VecDeque::new(),
            },
        }
    }

    pub(crate) fn inline(schema: SchemaRef, batches: Vec<RecordBatch>) -> Self {
        Self {
            schema,
            inner: StreamInner::Inline {
                batches: batches.into(),
            },
        }
    }

    pub(crate) fn empty(schema: SchemaRef) -> Self {
        Self {
            schema,
            inner: StreamInner::Empty,
        }
    }

    /// The result schema: manifest-derived, falling back to the batches'
    /// own schema for inline results without a manifest.
    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    /// The next batch in order, or `None` when the result is exhausted.
    pub async fn next_batch(&mut self) -> Result<Option<RecordBatch>> {
        match &mut self.inner {
            StreamInner::Empty => Ok(None),
            StreamInner::Inline { batches } => Ok(batches.pop_front()),
            StreamInner::Chunked { scheduler, buffer } => loop {
                if let Some(batch) = buffer.pop_front() {
                    return Ok(Some(batch));
                }
                if !scheduler.advance().await? {
                    return Ok(None);
                }
                let chunk = scheduler.current()?;
                buffer.extend(chunk.batches()?);
            },
        }
    }

    /// Stops any in-flight downloads and releases held chunks.
    pub fn close(&mut self) {
        if let StreamInner::Chunked { scheduler, buffer } = &mut self.inner {
            scheduler.close();
            buffer.clear();
        }
    }
}

/// Row-at-a-time view over a [`ResultStream`].
#[derive(Debug)]
pub struct RowCursor {
    stream: ResultStream,
    batch: Option<RecordBatch>,
    row: usize,
}

impl RowCursor {
    pub fn new(stream: ResultStream) -> Self {
        Self {
            stream,
            batch: None,
            row: 0,
        }
    }

    pub fn schema(&self) -> SchemaRef {
        self.stream.schema()
    }

    /// Moves to the next row. Returns `false` once the result is
    /// exhausted.
    pub async fn advance(&mut self) -> Result<bool> {
        if let Some(batch) = &self.batch {
            if self.row + 1 < batch.num_rows() {
                self.row += 1;
                return Ok(true);
            }
        }
        loop {
            match self.stream.next_batch().await? {
                Some(batch) if batch.num_rows() == 0 => continue,
                Some(batch) => {
                    self.batch = Some(batch);
                    self.row = 0;
                    return Ok(true);
                }
                None => {
                    self.batch = None;
                    return Ok(false);
                }
            }
        }
    }

    /// The column array backing the current row. Index with
    /// [`RowCursor::row_index`]; no copy of the decoded buffers is made.
    pub fn column(&self, index: usize) -> Result<&ArrayRef> {
        let batch = self
            .batch
            .as_ref()
            .ok_or_else(|| Error::invalid_state("cursor is not positioned on a row"))?;
        if index >= batch.num_columns() {
            return Err(Error::invalid_state(format!(
                "column index {index} out of range ({} columns)",
                batch.num_columns()
            )));
        }
        Ok(batch.column(index))
    }

    /// The current row's index within [`RowCursor::column`]'s arrays.
    pub fn row_index(&self) -> usize {
        self.row
    }

    pub fn close(&mut self) {
        self.stream.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::{Int64Array, StringArray};
    use arrow_ipc::writer::StreamWriter;
    use crate::protocol::{ColumnSchema, CompressionCodec};

    fn batch(ids: Vec<i64>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(ids))]).unwrap()
    }

    fn manifest() -> ResultManifest {
        ResultManifest {
            columns: vec![
                ColumnSchema {
                    name: "name".to_string(),
                    type_name: "STRING".to_string(),
                    position: 1,
                },
                ColumnSchema {
                    name: "id".to_string(),
                    type_name: "LONG".to_string(),
                    position: 0,
                },
            ],
            total_row_count: 0,
            total_chunk_count: 0,
            compression: CompressionCodec::None,
        }
    }

    #[test]
    fn type_mapping_covers_common_names() {
        assert_eq!(map_column_type("LONG"), DataType::Int64);
        assert_eq!(map_column_type("bigint"), DataType::Int64);
        assert_eq!(map_column_type("INT"), DataType::Int32);
        assert_eq!(map_column_type("DOUBLE"), DataType::Float64);
        assert_eq!(map_column_type("BOOLEAN"), DataType::Boolean);
        assert_eq!(map_column_type("DATE"), DataType::Date32);
        assert_eq!(
            map_column_type("TIMESTAMP"),
            DataType::Timestamp(TimeUnit::Microsecond, None)
        );
        // Unknown types decay to strings
        assert_eq!(map_column_type("INTERVAL"), DataType::Utf8);
    }

    #[test]
    fn manifest_schema_orders_by_position() {
        let schema = manifest_schema(&manifest());
        assert_eq!(schema.field(0).name(), "id");
        assert_eq!(schema.field(0).data_type(), &DataType::Int64);
        assert_eq!(schema.field(1).name(), "name");
        assert_eq!(schema.field(1).data_type(), &DataType::Utf8);
    }

    #[tokio::test]
    async fn empty_stream_has_schema_and_no_batches() {
        let mut stream = ResultStream::empty(manifest_schema(&manifest()));
        assert_eq!(stream.schema().fields().len(), 2);
        assert!(stream.next_batch().await.unwrap().is_none());
        assert!(stream.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn inline_stream_yields_batches_in_order() {
        let b1 = batch(vec![1, 2]);
        let b2 = batch(vec![3]);
        let mut stream = ResultStream::inline(b1.schema(), vec![b1, b2]);

        assert_eq!(stream.next_batch().await.unwrap().unwrap().num_rows(), 2);
        assert_eq!(stream.next_batch().await.unwrap().unwrap().num_rows(), 1);
        assert!(stream.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn row_cursor_walks_across_batches() {
        let b1 = batch(vec![10, 20]);
        let b2 = batch(vec![30]);
        let stream = ResultStream::inline(b1.schema(), vec![b1, b2]);
        let mut cursor = RowCursor::new(stream);

        let mut values = Vec::new();
        while cursor.advance().await.unwrap() {
            let column = cursor.column(0).unwrap();
            let ids = column.as_any().downcast_ref::<Int64Array>().unwrap();
            values.push(ids.value(cursor.row_index()));
        }
        assert_eq!(values, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn row_cursor_skips_empty_batches() {
        let empty = batch(vec![]);
        let full = batch(vec![7]);
        let stream = ResultStream::inline(full.schema(), vec![empty, full]);
        let mut cursor = RowCursor::new(stream);

        assert!(cursor.advance().await.unwrap());
        let ids = cursor
            .column(0)
            .unwrap()
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        assert_eq!(ids.value(cursor.row_index()), 7);
        assert!(!cursor.advance().await.unwrap());
    }

    #[tokio::test]
    async fn cursor_errors_when_not_positioned() {
        let stream = ResultStream::empty(Arc::new(Schema::empty()));
        let cursor = RowCursor::new(stream);
        assert!(matches!(cursor.column(0), Err(Error::InvalidState(_))));
    }

    #[test]
    fn build_decodes_inline_attachment() {
        let names = StringArray::from(vec!["a", "b"]);
        let schema = Arc::new(Schema::new(vec![Field::new("name", DataType::Utf8, true)]));
        let inline_batch =
            RecordBatch::try_new(schema.clone(), vec![Arc::new(names)]).unwrap();
        let mut data = Vec::new();
        {
            let mut writer = StreamWriter::try_new(&mut data, &schema).unwrap();
            writer.write(&inline_batch).unwrap();
            writer.finish().unwrap();
        }

        // Round-trips through decode; schema comes from the batch itself
        let batches = crate::fetch::decoder::decode_chunk(0, &data, CompressionCodec::None)
            .unwrap();
        let stream = ResultStream::inline(batches[0].schema(), batches);
        assert_eq!(stream.schema().field(0).name(), "name");
    }
}
