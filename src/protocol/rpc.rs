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

//! Legacy binary RPC client.
//!
//! The older warehouse endpoint speaks a length-prefixed binary protocol
//! over HTTP POST: each message is a `u32` big-endian length, a one-byte
//! message tag, then tag-specific fields. Operations are identified by a
//! 16-byte guid plus a 16-byte secret, and link fetches continue by row
//! offset rather than chunk index.
//!
//! The submit response may carry "direct results": an embedded manifest
//! plus either initial links or inline Arrow bytes, saving a poll roundtrip
//! for fast statements. The embedded status must still be validated; a
//! failed status with attached results is a failure.
//!
//! [`codec`] implements both directions of the wire format so that tests
//! can act as the server side.

use std::sync::Arc;

use bytes::Bytes;
use reqwest::Method;
use tracing::debug;

use crate::error::{Error, Result};
use crate::transfer::{TransferRequest, TransferRetryExecutor};

use super::{
    ChunkLinkBatch, RpcOperationHandle, StatementHandle, StatementOptions, StatementUpdate,
};

pub mod codec {
    //! Binary wire format: encoders and decoders for every message.

    use std::collections::HashMap;

    use bytes::{Buf, BufMut, Bytes, BytesMut};
    use chrono::{TimeZone, Utc};

    use crate::error::{Error, Result};
    use crate::protocol::{
        ChunkDescriptor, ChunkLink, ColumnSchema, CompressionCodec, ResultManifest,
        RpcOperationHandle, ServerError, StatementState, StatementStatus, StatementUpdate,
    };

    // Request tags
    pub const TAG_EXECUTE: u8 = 0x01;
    pub const TAG_STATUS: u8 = 0x02;
    pub const TAG_FETCH_LINKS: u8 = 0x03;
    pub const TAG_CANCEL: u8 = 0x04;
    pub const TAG_CLOSE: u8 = 0x05;

    // Response tags (request tag | 0x80)
    pub const TAG_EXECUTE_RESP: u8 = 0x81;
    pub const TAG_STATUS_RESP: u8 = 0x82;
    pub const TAG_FETCH_LINKS_RESP: u8 = 0x83;
    pub const TAG_CANCEL_RESP: u8 = 0x84;
    pub const TAG_CLOSE_RESP: u8 = 0x85;

    /// Direct results attached to an execute response.
    #[derive(Debug, Clone, Default)]
    pub struct DirectResults {
        pub manifest: Option<ResultManifest>,
        pub links: Vec<ChunkDescriptor>,
        pub inline_data: Option<Vec<u8>>,
    }

    /// A decoded message frame.
    #[derive(Debug, Clone)]
    pub struct Frame {
        pub tag: u8,
        pub payload: Bytes,
    }

    pub fn encode_frame(tag: u8, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + 1 + payload.len());
        buf.put_u32((1 + payload.len()) as u32);
        buf.put_u8(tag);
        buf.put_slice(payload);
        buf.freeze()
    }

    pub fn decode_frame(mut buf: Bytes) -> Result<Frame> {
        if buf.remaining() < 4 {
            return Err(Error::protocol("frame shorter than length prefix"));
        }
        let len = buf.get_u32() as usize;
        if len == 0 {
            return Err(Error::protocol("empty frame"));
        }
        if buf.remaining() != len {
            return Err(Error::protocol(format!(
                "frame length mismatch: declared {len}, got {}",
                buf.remaining()
            )));
        }
        let tag = buf.get_u8();
        Ok(Frame { tag, payload: buf })
    }

    fn need(buf: &impl Buf, n: usize, what: &str) -> Result<()> {
        if buf.remaining() < n {
            return Err(Error::protocol(format!("truncated {what}")));
        }
        Ok(())
    }

    fn put_str(buf: &mut BytesMut, s: &str) {
        buf.put_u32(s.len() as u32);
        buf.put_slice(s.as_bytes());
    }

    fn get_str(buf: &mut Bytes) -> Result<String> {
        need(buf, 4, "string length")?;
        let len = buf.get_u32() as usize;
        need(buf, len, "string")?;
        let raw = buf.split_to(len);
        String::from_utf8(raw.to_vec()).map_err(|_| Error::protocol("non-utf8 string"))
    }

    fn put_opt_str(buf: &mut BytesMut, s: Option<&str>) {
        match s {
            Some(s) => {
                buf.put_u8(1);
                put_str(buf, s);
            }
            None => buf.put_u8(0),
        }
    }

    fn get_opt_str(buf: &mut Bytes) -> Result<Option<String>> {
        need(buf, 1, "optional flag")?;
        match buf.get_u8() {
            0 => Ok(None),
            1 => Ok(Some(get_str(buf)?)),
            other => Err(Error::protocol(format!("invalid optional flag {other}"))),
        }
    }

    fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
        buf.put_u32(data.len() as u32);
        buf.put_slice(data);
    }

    fn get_bytes(buf: &mut Bytes) -> Result<Vec<u8>> {
        need(buf, 4, "byte-array length")?;
        let len = buf.get_u32() as usize;
        need(buf, len, "byte array")?;
        Ok(buf.split_to(len).to_vec())
    }

    fn put_handle(buf: &mut BytesMut, handle: &RpcOperationHandle) {
        buf.put_slice(&handle.guid);
        buf.put_slice(&handle.secret);
    }

    fn get_handle(buf: &mut Bytes) -> Result<RpcOperationHandle> {
        need(buf, 32, "operation handle")?;
        let mut guid = [0u8; 16];
        let mut secret = [0u8; 16];
        buf.copy_to_slice(&mut guid);
        buf.copy_to_slice(&mut secret);
        Ok(RpcOperationHandle { guid, secret })
    }

    fn state_to_u8(state: StatementState) -> u8 {
        match state {
            StatementState::Pending => 0,
            StatementState::Running => 1,
            StatementState::Succeeded => 2,
            StatementState::Failed => 3,
            StatementState::Canceled => 4,
            StatementState::Closed => 5,
        }
    }

    fn state_from_u8(value: u8) -> Result<StatementState> {
        Ok(match value {
            0 => StatementState::Pending,
            1 => StatementState::Running,
            2 => StatementState::Succeeded,
            3 => StatementState::Failed,
            4 => StatementState::Canceled,
            5 => StatementState::Closed,
            other => return Err(Error::protocol(format!("unknown operation state {other}"))),
        })
    }

    fn put_status(buf: &mut BytesMut, status: &StatementStatus) {
        buf.put_u8(state_to_u8(status.state));
        let error = status.error.as_ref();
        put_opt_str(buf, error.and_then(|e| e.code.as_deref()));
        put_opt_str(buf, error.and_then(|e| e.message.as_deref()));
    }

    fn get_status(buf: &mut Bytes) -> Result<StatementStatus> {
        need(buf, 1, "operation state")?;
        let state = state_from_u8(buf.get_u8())?;
        let code = get_opt_str(buf)?;
        let message = get_opt_str(buf)?;
        let error = if code.is_some() || message.is_some() {
            Some(ServerError { code, message })
        } else {
            None
        };
        Ok(StatementStatus { state, error })
    }

    fn put_manifest(buf: &mut BytesMut, manifest: &ResultManifest) {
        buf.put_u32(manifest.columns.len() as u32);
        for column in &manifest.columns {
            put_str(buf, &column.name);
            put_str(buf, &column.type_name);
            buf.put_i32(column.position);
        }
        buf.put_i64(manifest.total_row_count);
        buf.put_i64(manifest.total_chunk_count);
        buf.put_u8(match manifest.compression {
            CompressionCodec::None => 0,
            CompressionCodec::Lz4Frame => 1,
        });
    }

    fn get_manifest(buf: &mut Bytes) -> Result<ResultManifest> {
        need(buf, 4, "column count")?;
        let count = buf.get_u32() as usize;
        let mut columns = Vec::with_capacity(count);
        for _ in 0..count {
            let name = get_str(buf)?;
            let type_name = get_str(buf)?;
            need(buf, 4, "column position")?;
            let position = buf.get_i32();
            columns.push(ColumnSchema {
                name,
                type_name,
                position,
            });
        }
        need(buf, 17, "manifest totals")?;
        let total_row_count = buf.get_i64();
        let total_chunk_count = buf.get_i64();
        let compression = match buf.get_u8() {
            0 => CompressionCodec::None,
            1 => CompressionCodec::Lz4Frame,
            other => {
                return Err(Error::protocol(format!(
                    "unknown compression code {other}"
                )))
            }
        };
        Ok(ResultManifest {
            columns,
            total_row_count,
            total_chunk_count,
            compression,
        })
    }

    fn put_link(buf: &mut BytesMut, descriptor: &ChunkDescriptor, link: &ChunkLink) {
        buf.put_i64(descriptor.chunk_index);
        buf.put_i64(descriptor.row_offset);
        buf.put_i64(descriptor.row_count);
        buf.put_i64(descriptor.byte_count);
        put_str(buf, &link.url);
        buf.put_i64(link.expiry.timestamp_millis());
        buf.put_u32(link.headers.len() as u32);
        for (name, value) in &link.headers {
            put_str(buf, name);
            put_str(buf, value);
        }
    }

    fn get_link(buf: &mut Bytes) -> Result<ChunkDescriptor> {
        need(buf, 32, "link position fields")?;
        let chunk_index = buf.get_i64();
        let row_offset = buf.get_i64();
        let row_count = buf.get_i64();
        let byte_count = buf.get_i64();
        let url = get_str(buf)?;
        need(buf, 12, "link expiry and header count")?;
        let expiry_millis = buf.get_i64();
        let expiry = Utc
            .timestamp_millis_opt(expiry_millis)
            .single()
            .ok_or_else(|| Error::protocol(format!("invalid link expiry {expiry_millis}")))?;
        let header_count = buf.get_u32() as usize;
        let mut headers = HashMap::with_capacity(header_count);
        for _ in 0..header_count {
            let name = get_str(buf)?;
            let value = get_str(buf)?;
            headers.insert(name, value);
        }
        Ok(ChunkDescriptor {
            chunk_index,
            row_offset,
            row_count,
            byte_count,
            link: Some(ChunkLink {
                url,
                expiry,
                headers,
            }),
        })
    }

    fn put_links(buf: &mut BytesMut, links: &[ChunkDescriptor]) {
        let with_links: Vec<_> = links.iter().filter(|d| d.link.is_some()).collect();
        buf.put_u32(with_links.len() as u32);
        for descriptor in with_links {
            if let Some(link) = &descriptor.link {
                put_link(buf, descriptor, link);
            }
        }
    }

    fn get_links(buf: &mut Bytes) -> Result<Vec<ChunkDescriptor>> {
        need(buf, 4, "link count")?;
        let count = buf.get_u32() as usize;
        let mut links = Vec::with_capacity(count);
        for _ in 0..count {
            links.push(get_link(buf)?);
        }
        Ok(links)
    }

    // --- Execute ---

    pub fn encode_execute_request(
        sql: &str,
        catalog: Option<&str>,
        schema: Option<&str>,
        row_limit: Option<i64>,
    ) -> Bytes {
        let mut buf = BytesMut::new();
        put_str(&mut buf, sql);
        put_opt_str(&mut buf, catalog);
        put_opt_str(&mut buf, schema);
        buf.put_i64(row_limit.unwrap_or(-1));
        encode_frame(TAG_EXECUTE, &buf)
    }

    pub fn decode_execute_request(
        mut payload: Bytes,
    ) -> Result<(String, Option<String>, Option<String>, Option<i64>)> {
        let sql = get_str(&mut payload)?;
        let catalog = get_opt_str(&mut payload)?;
        let schema = get_opt_str(&mut payload)?;
        need(&payload, 8, "row limit")?;
        let row_limit = payload.get_i64();
        Ok((
            sql,
            catalog,
            schema,
            (row_limit >= 0).then_some(row_limit),
        ))
    }

    pub fn encode_execute_response(
        handle: &RpcOperationHandle,
        status: &StatementStatus,
        direct: Option<&DirectResults>,
    ) -> Bytes {
        let mut buf = BytesMut::new();
        put_handle(&mut buf, handle);
        put_status(&mut buf, status);
        match direct {
            Some(direct) => {
                buf.put_u8(1);
                match &direct.manifest {
                    Some(manifest) => {
                        buf.put_u8(1);
                        put_manifest(&mut buf, manifest);
                    }
                    None => buf.put_u8(0),
                }
                put_links(&mut buf, &direct.links);
                match &direct.inline_data {
                    Some(data) => {
                        buf.put_u8(1);
                        put_bytes(&mut buf, data);
                    }
                    None => buf.put_u8(0),
                }
            }
            None => buf.put_u8(0),
        }
        encode_frame(TAG_EXECUTE_RESP, &buf)
    }

    pub fn decode_execute_response(
        mut payload: Bytes,
    ) -> Result<(RpcOperationHandle, StatementUpdate)> {
        let handle = get_handle(&mut payload)?;
        let status = get_status(&mut payload)?;
        need(&payload, 1, "direct-results flag")?;
        let mut update = StatementUpdate::from_status(status);
        if payload.get_u8() == 1 {
            need(&payload, 1, "manifest flag")?;
            if payload.get_u8() == 1 {
                update.manifest = Some(get_manifest(&mut payload)?);
            }
            update.chunks = get_links(&mut payload)?;
            need(&payload, 1, "inline flag")?;
            if payload.get_u8() == 1 {
                update.inline_data = Some(get_bytes(&mut payload)?);
            }
        }
        Ok((handle, update))
    }

    // --- Status ---

    pub fn encode_status_request(handle: &RpcOperationHandle) -> Bytes {
        let mut buf = BytesMut::new();
        put_handle(&mut buf, handle);
        encode_frame(TAG_STATUS, &buf)
    }

    pub fn encode_status_response(status: &StatementStatus) -> Bytes {
        let mut buf = BytesMut::new();
        put_status(&mut buf, status);
        encode_frame(TAG_STATUS_RESP, &buf)
    }

    pub fn decode_status_response(mut payload: Bytes) -> Result<StatementStatus> {
        get_status(&mut payload)
    }

    // --- Fetch links ---

    pub fn encode_fetch_links_request(handle: &RpcOperationHandle, row_offset: i64) -> Bytes {
        let mut buf = BytesMut::new();
        put_handle(&mut buf, handle);
        buf.put_i64(row_offset);
        encode_frame(TAG_FETCH_LINKS, &buf)
    }

    pub fn decode_fetch_links_request(mut payload: Bytes) -> Result<(RpcOperationHandle, i64)> {
        let handle = get_handle(&mut payload)?;
        need(&payload, 8, "row offset")?;
        Ok((handle, payload.get_i64()))
    }

    pub fn encode_fetch_links_response(
        links: &[ChunkDescriptor],
        next_row_offset: Option<i64>,
    ) -> Bytes {
        let mut buf = BytesMut::new();
        put_links(&mut buf, links);
        buf.put_i64(next_row_offset.unwrap_or(-1));
        encode_frame(TAG_FETCH_LINKS_RESP, &buf)
    }

    pub fn decode_fetch_links_response(
        mut payload: Bytes,
    ) -> Result<(Vec<ChunkDescriptor>, Option<i64>)> {
        let links = get_links(&mut payload)?;
        need(&payload, 8, "next row offset")?;
        let next = payload.get_i64();
        Ok((links, (next >= 0).then_some(next)))
    }

    // --- Cancel / Close ---

    pub fn encode_cancel_request(handle: &RpcOperationHandle) -> Bytes {
        let mut buf = BytesMut::new();
        put_handle(&mut buf, handle);
        encode_frame(TAG_CANCEL, &buf)
    }

    pub fn encode_cancel_response() -> Bytes {
        encode_frame(TAG_CANCEL_RESP, &[])
    }

    pub fn encode_close_request(handle: &RpcOperationHandle) -> Bytes {
        let mut buf = BytesMut::new();
        put_handle(&mut buf, handle);
        encode_frame(TAG_CLOSE, &buf)
    }

    pub fn encode_close_response() -> Bytes {
        encode_frame(TAG_CLOSE_RESP, &[])
    }
}

/// Client for the legacy binary RPC endpoint.
#[derive(Debug)]
pub struct RpcClient {
    transfer: Arc<TransferRetryExecutor>,
    endpoint_url: String,
}

impl RpcClient {
    pub fn new(transfer: Arc<TransferRetryExecutor>, endpoint_url: impl Into<String>) -> Self {
        Self {
            transfer,
            endpoint_url: endpoint_url.into(),
        }
    }

    async fn call(&self, frame: Bytes, expected_tag: u8) -> Result<Bytes> {
        let request = TransferRequest::new(Method::POST, self.endpoint_url.clone())
            .header("Content-Type", "application/octet-stream")
            .body(frame);
        let response = self.transfer.execute(&request).await?;
        let frame = codec::decode_frame(response.body)?;
        if frame.tag != expected_tag {
            return Err(Error::protocol(format!(
                "unexpected message tag {:#04x}, expected {expected_tag:#04x}",
                frame.tag
            )));
        }
        Ok(frame.payload)
    }

    pub async fn submit(
        &self,
        sql: &str,
        options: &StatementOptions,
    ) -> Result<(StatementHandle, StatementUpdate)> {
        let frame = codec::encode_execute_request(
            sql,
            options.catalog.as_deref(),
            options.schema.as_deref(),
            options.row_limit,
        );
        let payload = self.call(frame, codec::TAG_EXECUTE_RESP).await?;
        let (operation, update) = codec::decode_execute_response(payload)?;
        let handle = StatementHandle::BinaryRpc { operation };
        debug!(
            "submitted operation {} (state {:?})",
            handle.id(),
            update.status.state
        );
        Ok((handle, update))
    }

    pub async fn poll(&self, operation: &RpcOperationHandle) -> Result<StatementUpdate> {
        let payload = self
            .call(codec::encode_status_request(operation), codec::TAG_STATUS_RESP)
            .await?;
        let status = codec::decode_status_response(payload)?;
        Ok(StatementUpdate::from_status(status))
    }

    pub async fn fetch_links(
        &self,
        operation: &RpcOperationHandle,
        row_offset: i64,
    ) -> Result<ChunkLinkBatch> {
        let payload = self
            .call(
                codec::encode_fetch_links_request(operation, row_offset),
                codec::TAG_FETCH_LINKS_RESP,
            )
            .await?;
        let (descriptors, next_row_offset) = codec::decode_fetch_links_response(payload)?;
        Ok(ChunkLinkBatch {
            descriptors,
            next_chunk_index: None,
            next_row_offset,
        })
    }

    pub async fn cancel(&self, operation: &RpcOperationHandle) -> Result<()> {
        self.call(codec::encode_cancel_request(operation), codec::TAG_CANCEL_RESP)
            .await?;
        Ok(())
    }

    pub async fn close(&self, operation: &RpcOperationHandle) -> Result<()> {
        self.call(codec::encode_close_request(operation), codec::TAG_CLOSE_RESP)
            .await?;
        Ok(())
    }
}
