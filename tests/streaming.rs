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

//! End-to-end streaming scenarios over a mock warehouse: REST submit and
//! poll, link fetches, chunk downloads from storage URLs, decode and
//! in-order delivery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arrow_array::{Int64Array, RecordBatch};
use arrow_ipc::writer::StreamWriter;
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use lz4_flex::frame::FrameEncoder;
use reqwest::Method;
use tokio::time::timeout;

use lakestream::{
    Backend, ConnectionConfig, Error, ResultStream, RestClient, RowCursor, StatementExecutor,
    StatementOptions, TransferRequest, TransferResponse, TransferRetryExecutor, Transport,
    TransportError,
};

const ROWS_PER_CHUNK: i64 = 250;

fn chunk_ipc(chunk_index: i64, compressed: bool) -> Vec<u8> {
    let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)]));
    let start = chunk_index * ROWS_PER_CHUNK;
    let ids: Vec<i64> = (start..start + ROWS_PER_CHUNK).collect();
    let batch = RecordBatch::try_new(schema.clone(), vec![Arc::new(Int64Array::from(ids))]).unwrap();

    let mut raw = Vec::new();
    {
        let mut writer = StreamWriter::try_new(&mut raw, &schema).unwrap();
        writer.write(&batch).unwrap();
        writer.finish().unwrap();
    }
    if compressed {
        use std::io::Write;
        let mut encoder = FrameEncoder::new(Vec::new());
        encoder.write_all(&raw).unwrap();
        encoder.finish().unwrap()
    } else {
        raw
    }
}

fn link_json(chunk_index: i64, expiry: DateTime<Utc>) -> String {
    format!(
        r#"{{
            "external_link": "https://storage.example.com/chunk{chunk_index}",
            "expiration": "{}",
            "chunk_index": {chunk_index},
            "row_offset": {},
            "row_count": {ROWS_PER_CHUNK},
            "byte_count": 4096
        }}"#,
        expiry.to_rfc3339(),
        chunk_index * ROWS_PER_CHUNK,
    )
}

/// Mock warehouse plus storage service, routed by URL. Every request is
/// appended to an event log so tests can assert ordering.
#[derive(Debug)]
struct Warehouse {
    total_chunks: i64,
    compressed: bool,
    /// Expiry for links embedded in the submit response.
    initial_link_expiry: DateTime<Utc>,
    /// How many links the submit response volunteers.
    initial_links: i64,
    poll_states: Mutex<Vec<&'static str>>,
    events: Mutex<Vec<String>>,
    cancels: AtomicUsize,
}

impl Warehouse {
    fn new(total_chunks: i64) -> Self {
        Self {
            total_chunks,
            compressed: false,
            initial_link_expiry: Utc::now() + chrono::Duration::hours(1),
            initial_links: total_chunks,
            poll_states: Mutex::new(vec!["SUCCEEDED"]),
            events: Mutex::new(Vec::new()),
            cancels: AtomicUsize::new(0),
        }
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn manifest_json(&self) -> String {
        let compression = if self.compressed {
            r#""result_compression": "LZ4_FRAME","#
        } else {
            ""
        };
        format!(
            r#""manifest": {{
                "schema": {{"columns": [{{"name": "id", "type_name": "LONG", "position": 0}}]}},
                "total_chunk_count": {},
                "total_row_count": {},
                {compression}
                "format": "ARROW_STREAM"
            }}"#,
            self.total_chunks,
            self.total_chunks * ROWS_PER_CHUNK,
        )
    }

    fn submit_json(&self, state: &str) -> String {
        let links: Vec<String> = (0..self.initial_links)
            .map(|i| link_json(i, self.initial_link_expiry))
            .collect();
        format!(
            r#"{{
                "statement_id": "stmt-1",
                "status": {{"state": "{state}"}},
                {},
                "result": {{"external_links": [{}]}}
            }}"#,
            self.manifest_json(),
            links.join(",")
        )
    }

    fn respond(&self, status: u16, body: impl Into<Bytes>) -> TransferResponse {
        TransferResponse {
            status,
            retry_after: None,
            body: body.into(),
        }
    }
}

#[async_trait]
impl Transport for Warehouse {
    async fn roundtrip(
        &self,
        request: &TransferRequest,
    ) -> std::result::Result<TransferResponse, TransportError> {
        let url = &request.url;
        self.events
            .lock()
            .unwrap()
            .push(format!("{} {}", request.method, url));

        if url.contains("storage.example.com/chunk") {
            let index: i64 = url.rsplit("chunk").next().unwrap().parse().unwrap();
            return Ok(self.respond(200, chunk_ipc(index, self.compressed)));
        }
        if url.ends_with("/cancel") {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            return Ok(self.respond(200, "{}"));
        }
        if url.contains("/result/chunks/") {
            let start: i64 = url.rsplit('/').next().unwrap().parse().unwrap();
            let links: Vec<String> = (start..self.total_chunks)
                .map(|i| link_json(i, Utc::now() + chrono::Duration::hours(1)))
                .collect();
            let body = format!(r#"{{"external_links": [{}]}}"#, links.join(","));
            return Ok(self.respond(200, body));
        }
        if request.method == Method::POST && url.ends_with("/statements") {
            return Ok(self.respond(200, self.submit_json("PENDING")));
        }
        if request.method == Method::GET && url.contains("/statements/stmt-1") {
            let mut states = self.poll_states.lock().unwrap();
            let state = if states.len() > 1 {
                states.remove(0)
            } else {
                states[0]
            };
            return Ok(self.respond(200, self.submit_json(state)));
        }
        if request.method == Method::DELETE {
            return Ok(self.respond(200, "{}"));
        }
        Ok(self.respond(404, "no route"))
    }
}

struct Harness {
    warehouse: Arc<Warehouse>,
    executor: StatementExecutor,
    backend: Arc<Backend>,
    transfer: Arc<TransferRetryExecutor>,
    config: ConnectionConfig,
}

fn harness(warehouse: Arc<Warehouse>, window: usize) -> Harness {
    let config = ConnectionConfig {
        poll_interval: Duration::from_millis(10),
        max_parallel_downloads: window,
        ..ConnectionConfig::default()
    };
    let transfer = Arc::new(TransferRetryExecutor::new(
        warehouse.clone(),
        &config.retry,
    ));
    let backend = Arc::new(Backend::Rest(RestClient::new(
        transfer.clone(),
        "https://warehouse.example.com",
        "wh-1",
    )));
    let executor = StatementExecutor::new(backend.clone(), config.clone());
    Harness {
        warehouse,
        executor,
        backend,
        transfer,
        config,
    }
}

async fn run_to_stream(h: &Harness, sql: &str) -> ResultStream {
    let (handle, update) = h
        .executor
        .execute(sql, &StatementOptions::default())
        .await
        .unwrap();
    ResultStream::build(
        h.backend.clone(),
        &handle,
        update,
        h.transfer.clone(),
        &h.config,
    )
    .unwrap()
}

#[tokio::test]
async fn four_chunks_window_two_stream_in_order() {
    let h = harness(Arc::new(Warehouse::new(4)), 2);
    let mut stream = run_to_stream(&h, "SELECT * FROM events").await;

    let mut first_ids = Vec::new();
    let mut total_rows = 0usize;
    while let Some(batch) = timeout(Duration::from_secs(10), stream.next_batch())
        .await
        .unwrap()
        .unwrap()
    {
        let ids = batch
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        first_ids.push(ids.value(0));
        total_rows += batch.num_rows();
    }

    // Strict chunk order and the full row count
    assert_eq!(first_ids, vec![0, 250, 500, 750]);
    assert_eq!(total_rows, 1000);
    assert_eq!(stream.schema().field(0).name(), "id");
    // Nothing was cancelled along the way
    assert_eq!(h.warehouse.cancels.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn expired_initial_link_is_resolved_before_download() {
    let warehouse = Arc::new(Warehouse {
        // Links in the submit response are already expired
        initial_link_expiry: Utc::now() - chrono::Duration::minutes(5),
        ..Warehouse::new(2)
    });
    let h = harness(warehouse.clone(), 2);
    let mut stream = run_to_stream(&h, "SELECT * FROM events").await;

    let mut rows = 0usize;
    while let Some(batch) = timeout(Duration::from_secs(10), stream.next_batch())
        .await
        .unwrap()
        .unwrap()
    {
        rows += batch.num_rows();
    }
    assert_eq!(rows, 500);

    // The link fetch must precede the first storage download
    let events = warehouse.events();
    let refetch = events
        .iter()
        .position(|e| e.contains("/result/chunks/"))
        .expect("no link refetch happened");
    let download = events
        .iter()
        .position(|e| e.contains("storage.example.com"))
        .expect("no download happened");
    assert!(refetch < download, "events: {events:?}");
}

#[tokio::test]
async fn lz4_compressed_chunks_decode() {
    let warehouse = Arc::new(Warehouse {
        compressed: true,
        ..Warehouse::new(2)
    });
    let h = harness(warehouse, 2);
    let mut stream = run_to_stream(&h, "SELECT * FROM events").await;

    let mut rows = 0usize;
    while let Some(batch) = timeout(Duration::from_secs(10), stream.next_batch())
        .await
        .unwrap()
        .unwrap()
    {
        rows += batch.num_rows();
    }
    assert_eq!(rows, 500);
}

#[tokio::test]
async fn links_fetched_on_demand_when_not_volunteered() {
    let warehouse = Arc::new(Warehouse {
        // The submit response names 3 chunks but attaches no links
        initial_links: 0,
        ..Warehouse::new(3)
    });
    let h = harness(warehouse.clone(), 2);
    let mut stream = run_to_stream(&h, "SELECT * FROM events").await;

    let mut rows = 0usize;
    while let Some(batch) = timeout(Duration::from_secs(10), stream.next_batch())
        .await
        .unwrap()
        .unwrap()
    {
        rows += batch.num_rows();
    }
    assert_eq!(rows, 750);

    let events = warehouse.events();
    assert!(events.iter().any(|e| e.contains("/result/chunks/")));
}

#[tokio::test]
async fn row_cursor_end_to_end() {
    let h = harness(Arc::new(Warehouse::new(2)), 2);
    let stream = run_to_stream(&h, "SELECT * FROM events").await;
    let mut cursor = RowCursor::new(stream);

    let mut count = 0i64;
    while timeout(Duration::from_secs(10), cursor.advance())
        .await
        .unwrap()
        .unwrap()
    {
        let ids = cursor
            .column(0)
            .unwrap()
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        assert_eq!(ids.value(cursor.row_index()), count);
        count += 1;
    }
    assert_eq!(count, 500);
}

/// Serves an inline (attachment) result with no external links.
#[derive(Debug)]
struct InlineWarehouse {
    attachment: String,
}

#[async_trait]
impl Transport for InlineWarehouse {
    async fn roundtrip(
        &self,
        _request: &TransferRequest,
    ) -> std::result::Result<TransferResponse, TransportError> {
        let body = format!(
            r#"{{
                "statement_id": "stmt-inline",
                "status": {{"state": "SUCCEEDED"}},
                "manifest": {{
                    "schema": {{"columns": [{{"name": "id", "type_name": "LONG", "position": 0}}]}},
                    "total_chunk_count": 0,
                    "total_row_count": {ROWS_PER_CHUNK}
                }},
                "result": {{"attachment": "{}"}}
            }}"#,
            self.attachment
        );
        Ok(TransferResponse {
            status: 200,
            retry_after: None,
            body: Bytes::from(body),
        })
    }
}

#[tokio::test]
async fn inline_attachment_streams_without_downloads() {
    let transport = Arc::new(InlineWarehouse {
        attachment: STANDARD.encode(chunk_ipc(0, false)),
    });
    let config = ConnectionConfig::default();
    let transfer = Arc::new(TransferRetryExecutor::new(transport, &config.retry));
    let backend = Arc::new(Backend::Rest(RestClient::new(
        transfer.clone(),
        "https://warehouse.example.com",
        "wh-1",
    )));
    let executor = StatementExecutor::new(backend.clone(), config.clone());

    let (handle, update) = executor
        .execute("SELECT * FROM small", &StatementOptions::default())
        .await
        .unwrap();
    let mut stream =
        ResultStream::build(backend, &handle, update, transfer, &config).unwrap();

    let batch = stream.next_batch().await.unwrap().unwrap();
    assert_eq!(batch.num_rows(), ROWS_PER_CHUNK as usize);
    assert!(stream.next_batch().await.unwrap().is_none());
}

/// Serves a successful statement with no result data at all.
#[derive(Debug)]
struct EmptyWarehouse;

#[async_trait]
impl Transport for EmptyWarehouse {
    async fn roundtrip(
        &self,
        _request: &TransferRequest,
    ) -> std::result::Result<TransferResponse, TransportError> {
        Ok(TransferResponse {
            status: 200,
            retry_after: None,
            body: Bytes::from_static(
                br#"{
                    "statement_id": "stmt-empty",
                    "status": {"state": "SUCCEEDED"},
                    "manifest": {
                        "schema": {"columns": [{"name": "id", "type_name": "LONG", "position": 0}]},
                        "total_chunk_count": 0,
                        "total_row_count": 0
                    }
                }"#,
            ),
        })
    }
}

#[tokio::test]
async fn empty_result_exposes_schema() {
    let config = ConnectionConfig::default();
    let transfer = Arc::new(TransferRetryExecutor::new(
        Arc::new(EmptyWarehouse),
        &config.retry,
    ));
    let backend = Arc::new(Backend::Rest(RestClient::new(
        transfer.clone(),
        "https://warehouse.example.com",
        "wh-1",
    )));
    let executor = StatementExecutor::new(backend.clone(), config.clone());

    let (handle, update) = executor
        .execute("CREATE TABLE t (id LONG)", &StatementOptions::default())
        .await
        .unwrap();
    let mut stream =
        ResultStream::build(backend, &handle, update, transfer, &config).unwrap();

    assert_eq!(stream.schema().field(0).name(), "id");
    assert!(stream.next_batch().await.unwrap().is_none());
}

/// A storage service that fails a chunk's download on every attempt.
#[derive(Debug)]
struct BrokenStorage {
    inner: Arc<Warehouse>,
    broken_chunk: i64,
}

#[async_trait]
impl Transport for BrokenStorage {
    async fn roundtrip(
        &self,
        request: &TransferRequest,
    ) -> std::result::Result<TransferResponse, TransportError> {
        if request
            .url
            .contains(&format!("storage.example.com/chunk{}", self.broken_chunk))
        {
            return Ok(TransferResponse {
                status: 500,
                retry_after: None,
                body: Bytes::from_static(b"storage exploded"),
            });
        }
        self.inner.roundtrip(request).await
    }
}

#[tokio::test]
async fn download_failure_surfaces_after_earlier_chunks() {
    let transport = Arc::new(BrokenStorage {
        inner: Arc::new(Warehouse::new(3)),
        broken_chunk: 1,
    });
    let config = ConnectionConfig {
        poll_interval: Duration::from_millis(10),
        max_parallel_downloads: 3,
        ..ConnectionConfig::default()
    };
    let transfer = Arc::new(TransferRetryExecutor::new(transport, &config.retry));
    let backend = Arc::new(Backend::Rest(RestClient::new(
        transfer.clone(),
        "https://warehouse.example.com",
        "wh-1",
    )));
    let executor = StatementExecutor::new(backend.clone(), config.clone());

    let (handle, update) = executor
        .execute("SELECT * FROM events", &StatementOptions::default())
        .await
        .unwrap();
    let mut stream =
        ResultStream::build(backend, &handle, update, transfer, &config).unwrap();

    // Chunk 0 is delivered
    let batch = timeout(Duration::from_secs(10), stream.next_batch())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(batch.num_rows(), ROWS_PER_CHUNK as usize);

    // Chunk 1's failure surfaces next
    let err = timeout(Duration::from_secs(10), stream.next_batch())
        .await
        .unwrap()
        .unwrap_err();
    match err {
        Error::Transport { message } => assert!(message.contains("storage exploded")),
        other => panic!("unexpected {other:?}"),
    }

    stream.close();
}
