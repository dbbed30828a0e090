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

//! REST statement-execution client.
//!
//! Endpoints:
//! - `POST   {base}/api/2.0/sql/statements` — submit
//! - `GET    {base}/api/2.0/sql/statements/{id}` — poll status
//! - `POST   {base}/api/2.0/sql/statements/{id}/cancel` — cancel
//! - `DELETE {base}/api/2.0/sql/statements/{id}` — close
//! - `GET    {base}/api/2.0/sql/statements/{id}/result/chunks/{index}` —
//!   fetch chunk links starting at `index`
//!
//! Wire shapes live in the private `wire` module; everything public here
//! speaks the protocol-neutral model from [`super`].

use std::collections::BTreeMap;
use std::sync::Arc;

use reqwest::Method;
use tracing::debug;

use crate::error::{Error, Result};
use crate::transfer::{TransferRequest, TransferRetryExecutor};

use super::{
    ChunkDescriptor, ChunkLink, ChunkLinkBatch, ColumnSchema, CompressionCodec, ResultManifest,
    ServerError, StatementHandle, StatementOptions, StatementState, StatementStatus,
    StatementUpdate,
};

mod wire {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serialize};
    use std::collections::HashMap;

    #[derive(Debug, Clone, Deserialize)]
    pub struct StatementResponse {
        pub statement_id: String,
        pub status: StatementStatus,
        #[serde(default)]
        pub manifest: Option<ResultManifest>,
        #[serde(default)]
        pub result: Option<ResultData>,
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct StatementStatus {
        pub state: StatementState,
        #[serde(default)]
        pub error: Option<ServiceError>,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
    #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
    pub enum StatementState {
        Pending,
        Running,
        Succeeded,
        Failed,
        Canceled,
        Closed,
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct ServiceError {
        #[serde(default)]
        pub error_code: Option<String>,
        #[serde(default)]
        pub message: Option<String>,
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct ResultManifest {
        pub schema: ResultSchema,
        #[serde(default)]
        pub total_chunk_count: Option<i64>,
        #[serde(default)]
        pub total_row_count: Option<i64>,
        #[serde(default)]
        pub chunks: Option<Vec<ChunkInfo>>,
        #[serde(default)]
        pub result_compression: Option<String>,
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct ResultSchema {
        pub columns: Vec<ColumnInfo>,
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct ColumnInfo {
        pub name: String,
        pub type_name: String,
        pub position: i32,
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct ChunkInfo {
        pub chunk_index: i64,
        pub row_offset: i64,
        pub row_count: i64,
        pub byte_count: i64,
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct ResultData {
        #[serde(default)]
        pub external_links: Option<Vec<ExternalLink>>,
        #[serde(default)]
        pub next_chunk_index: Option<i64>,
        /// Inline Arrow IPC data, base64-encoded in JSON.
        #[serde(default, deserialize_with = "deserialize_base64_attachment")]
        pub attachment: Option<Vec<u8>>,
    }

    fn deserialize_base64_attachment<'de, D>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<String> = Option::deserialize(deserializer)?;
        match opt {
            Some(s) if !s.is_empty() => STANDARD
                .decode(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
            _ => Ok(None),
        }
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct ExternalLink {
        pub external_link: String,
        /// ISO 8601 timestamp.
        pub expiration: String,
        pub chunk_index: i64,
        pub row_offset: i64,
        pub row_count: i64,
        pub byte_count: i64,
        #[serde(default)]
        pub http_headers: Option<HashMap<String, String>>,
    }

    #[derive(Debug, Clone, Serialize)]
    pub struct ExecuteStatementRequest {
        pub warehouse_id: String,
        pub statement: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub catalog: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub schema: Option<String>,
        pub disposition: String,
        pub format: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub wait_timeout: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub on_wait_timeout: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub row_limit: Option<i64>,
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct GetChunksResponse {
        #[serde(default)]
        pub next_chunk_index: Option<i64>,
        #[serde(default)]
        pub external_links: Option<Vec<ExternalLink>>,
    }
}

/// Client for the REST statement-execution API.
#[derive(Debug)]
pub struct RestClient {
    transfer: Arc<TransferRetryExecutor>,
    base_url: String,
    warehouse_id: String,
}

impl RestClient {
    pub fn new(
        transfer: Arc<TransferRetryExecutor>,
        base_url: impl Into<String>,
        warehouse_id: impl Into<String>,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            transfer,
            base_url,
            warehouse_id: warehouse_id.into(),
        }
    }

    fn statements_url(&self) -> String {
        format!("{}/api/2.0/sql/statements", self.base_url)
    }

    /// Submits a statement. The response may already be terminal and may
    /// carry result material.
    pub async fn submit(
        &self,
        sql: &str,
        options: &StatementOptions,
    ) -> Result<(StatementHandle, StatementUpdate)> {
        let body = wire::ExecuteStatementRequest {
            warehouse_id: self.warehouse_id.clone(),
            statement: sql.to_string(),
            catalog: options.catalog.clone(),
            schema: options.schema.clone(),
            disposition: "EXTERNAL_LINKS".to_string(),
            format: "ARROW_STREAM".to_string(),
            wait_timeout: Some("10s".to_string()),
            on_wait_timeout: Some("CONTINUE".to_string()),
            row_limit: options.row_limit,
        };
        let request = TransferRequest::new(Method::POST, self.statements_url()).json(&body)?;
        let response = self.transfer.execute(&request).await?;

        let parsed: wire::StatementResponse = serde_json::from_slice(&response.body)
            .map_err(|e| Error::protocol(format!("malformed submit response: {e}")))?;
        debug!(
            "submitted statement {} (state {:?})",
            parsed.statement_id, parsed.status.state
        );

        let handle = StatementHandle::Rest {
            statement_id: parsed.statement_id.clone(),
        };
        Ok((handle, convert_statement_response(parsed)?))
    }

    pub async fn poll(&self, statement_id: &str) -> Result<StatementUpdate> {
        let url = format!("{}/{}", self.statements_url(), statement_id);
        let response = self.transfer.execute(&TransferRequest::get(url)).await?;
        let parsed: wire::StatementResponse = serde_json::from_slice(&response.body)
            .map_err(|e| Error::protocol(format!("malformed status response: {e}")))?;
        convert_statement_response(parsed)
    }

    pub async fn cancel(&self, statement_id: &str) -> Result<()> {
        let url = format!("{}/{}/cancel", self.statements_url(), statement_id);
        self.transfer
            .execute(&TransferRequest::new(Method::POST, url))
            .await?;
        Ok(())
    }

    /// Closes a statement. DELETE is deliberately outside the retry gate,
    /// so this runs at most once.
    pub async fn close(&self, statement_id: &str) -> Result<()> {
        let url = format!("{}/{}", self.statements_url(), statement_id);
        self.transfer
            .execute(&TransferRequest::new(Method::DELETE, url))
            .await?;
        Ok(())
    }

    /// Fetches download links for chunks starting at `chunk_index`.
    pub async fn chunk_links(&self, statement_id: &str, chunk_index: i64) -> Result<ChunkLinkBatch> {
        let url = format!(
            "{}/{}/result/chunks/{}",
            self.statements_url(),
            statement_id,
            chunk_index
        );
        let response = self.transfer.execute(&TransferRequest::get(url)).await?;
        let parsed: wire::GetChunksResponse = serde_json::from_slice(&response.body)
            .map_err(|e| Error::protocol(format!("malformed chunk-links response: {e}")))?;

        let mut descriptors = Vec::new();
        for link in parsed.external_links.unwrap_or_default() {
            descriptors.push(convert_external_link(link)?);
        }
        Ok(ChunkLinkBatch {
            descriptors,
            next_chunk_index: parsed.next_chunk_index,
            next_row_offset: None,
        })
    }
}

fn convert_state(state: wire::StatementState) -> StatementState {
    match state {
        wire::StatementState::Pending => StatementState::Pending,
        wire::StatementState::Running => StatementState::Running,
        wire::StatementState::Succeeded => StatementState::Succeeded,
        wire::StatementState::Failed => StatementState::Failed,
        wire::StatementState::Canceled => StatementState::Canceled,
        wire::StatementState::Closed => StatementState::Closed,
    }
}

fn convert_external_link(link: wire::ExternalLink) -> Result<ChunkDescriptor> {
    let expiry = chrono::DateTime::parse_from_rfc3339(&link.expiration)
        .map_err(|e| {
            Error::protocol(format!(
                "invalid link expiration {:?}: {e}",
                link.expiration
            ))
        })?
        .with_timezone(&chrono::Utc);
    Ok(ChunkDescriptor {
        chunk_index: link.chunk_index,
        row_offset: link.row_offset,
        row_count: link.row_count,
        byte_count: link.byte_count,
        link: Some(ChunkLink {
            url: link.external_link,
            expiry,
            headers: link.http_headers.unwrap_or_default(),
        }),
    })
}

fn convert_statement_response(response: wire::StatementResponse) -> Result<StatementUpdate> {
    let status = StatementStatus {
        state: convert_state(response.status.state),
        error: response.status.error.map(|e| ServerError {
            code: e.error_code,
            message: e.message,
        }),
    };

    // Manifest chunk metadata first, then overlay any links the server
    // volunteered with the response.
    let mut chunks: BTreeMap<i64, ChunkDescriptor> = BTreeMap::new();
    let manifest = match response.manifest {
        Some(m) => {
            for info in m.chunks.iter().flatten() {
                chunks.insert(
                    info.chunk_index,
                    ChunkDescriptor {
                        chunk_index: info.chunk_index,
                        row_offset: info.row_offset,
                        row_count: info.row_count,
                        byte_count: info.byte_count,
                        link: None,
                    },
                );
            }
            Some(ResultManifest {
                columns: m
                    .schema
                    .columns
                    .iter()
                    .map(|c| ColumnSchema {
                        name: c.name.clone(),
                        type_name: c.type_name.clone(),
                        position: c.position,
                    })
                    .collect(),
                total_row_count: m.total_row_count.unwrap_or(0),
                total_chunk_count: m.total_chunk_count.unwrap_or(0),
                compression: CompressionCodec::from_label(m.result_compression.as_deref())?,
            })
        }
        None => None,
    };

    let inline_data = match response.result {
        Some(result) => {
            for link in result.external_links.unwrap_or_default() {
                let descriptor = convert_external_link(link)?;
                chunks.insert(descriptor.chunk_index, descriptor);
            }
            result.attachment
        }
        None => None,
    };

    Ok(StatementUpdate {
        status,
        manifest,
        chunks: chunks.into_values().collect(),
        inline_data,
    })
}
