//! Remote metadata and chunk store client.
//!
//! Two surfaces behind one struct: a SQL-over-HTTP control-plane endpoint
//! for metadata queries, and the data-plane API for content download,
//! status updates and chunk uploads. Both are plain HTTP; nothing here
//! holds cross-process locks, so two concurrent runs against the same
//! pending set can race (accepted operational constraint).

use std::path::Path;
use std::time::Duration;

use chrono::NaiveDate;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{Chunk, Document, DocumentFormat, DocumentStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("query rejected: {0}")]
    Query(String),

    #[error("unexpected status {status} from {endpoint}")]
    Status { status: u16, endpoint: String },

    #[error("malformed row: {0}")]
    Row(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Data-plane API: document content, status, chunk uploads.
    pub api_base_url: String,
    /// Control-plane host for the SQL-over-HTTP endpoint.
    pub control_api_url: String,
    pub account_id: String,
    pub api_token: String,
    pub database_id: String,
}

/// Selection criteria for a pending-document fetch.
#[derive(Debug, Clone, Default)]
pub struct DocumentFilter {
    /// Maximum rows to return; 0 means no LIMIT clause.
    pub limit: usize,
    /// Publication year, matched via the owning study.
    pub year: Option<i32>,
    /// Publication month (requires `year`).
    pub month: Option<u32>,
    /// Also select documents already in `error` state.
    pub include_errors: bool,
}

pub struct RemoteStore {
    client: Client,
    config: StoreConfig,
}

impl RemoteStore {
    pub fn new(config: StoreConfig) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .user_agent("vellum/0.1 (document processor)")
            .build()?;
        Ok(Self { client, config })
    }

    // ── Control plane ────────────────────────────────────────────────────

    /// Run one parameterized SQL statement and return its result rows.
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Value>, StoreError> {
        let url = format!(
            "{}/client/v4/accounts/{}/d1/database/{}/query",
            self.config.control_api_url.trim_end_matches('/'),
            self.config.account_id,
            self.config.database_id,
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_token)
            .json(&json!({ "sql": sql, "params": params }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(StoreError::Status {
                status: response.status().as_u16(),
                endpoint: "query".to_string(),
            });
        }

        let body: Value = response.json().await?;
        if body["success"].as_bool() != Some(true) {
            return Err(StoreError::Query(body["errors"].to_string()));
        }

        Ok(body["result"][0]["results"]
            .as_array()
            .cloned()
            .unwrap_or_default())
    }

    /// Documents awaiting processing, ordered by id.
    pub async fn pending_documents(
        &self,
        filter: &DocumentFilter,
    ) -> Result<Vec<Document>, StoreError> {
        let (sql, params) = build_pending_query(filter);
        let rows = self.query(&sql, &params).await?;
        debug!(rows = rows.len(), "pending-document fetch");
        rows.iter().map(document_from_row).collect()
    }

    /// Stamp the owning study row once its document is processed.
    /// Falls back to a source-id lookup when the link is missing.
    pub async fn mark_study_processed(
        &self,
        study_id: Option<i64>,
        pmid: Option<&str>,
        pmcid: Option<&str>,
    ) -> Result<(), StoreError> {
        const METHOD: &str = "rag_batch_v1";

        if let Some(id) = study_id {
            self.query(
                "UPDATE studies SET extraction_method = ?, processed_at = datetime('now') WHERE id = ?",
                &[json!(METHOD), json!(id)],
            )
            .await?;
            return Ok(());
        }

        let source_id = match (pmid, pmcid) {
            (Some(pmid), _) => Some(format!("PMID:{pmid}")),
            (None, Some(pmcid)) if pmcid.starts_with("PMC") => Some(pmcid.to_string()),
            (None, Some(pmcid)) => Some(format!("PMC{pmcid}")),
            (None, None) => None,
        };

        if let Some(source_id) = source_id {
            self.query(
                "UPDATE studies SET extraction_method = ?, processed_at = datetime('now') WHERE source_id = ?",
                &[json!(METHOD), json!(source_id)],
            )
            .await?;
        }
        Ok(())
    }

    // ── Data plane ───────────────────────────────────────────────────────

    /// Download raw document content to `dest`. Non-200 is a failure.
    pub async fn download_document(&self, id: &str, dest: &Path) -> Result<(), StoreError> {
        let url = format!("{}/api/documents/{id}/content", self.api_base());
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(StoreError::Status {
                status: response.status().as_u16(),
                endpoint: format!("documents/{id}/content"),
            });
        }
        let bytes = response.bytes().await?;
        tokio::fs::write(dest, &bytes).await?;
        Ok(())
    }

    /// Update a document's lifecycle status.
    ///
    /// Soft failure by contract: a rejected or unreachable update is
    /// logged and not retried inline.
    pub async fn update_status(
        &self,
        id: &str,
        status: DocumentStatus,
        chunk_count: Option<usize>,
        error_message: Option<&str>,
    ) {
        let url = format!("{}/api/documents/{id}/status", self.api_base());
        let mut payload = json!({ "status": status.as_str() });
        if let Some(count) = chunk_count {
            payload["chunkCount"] = count.into();
        }
        if let Some(message) = error_message {
            payload["errorMessage"] = message.into();
        }

        match self.client.patch(&url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => warn!(
                document = id,
                status = status.as_str(),
                http = response.status().as_u16(),
                "status update rejected"
            ),
            Err(e) => warn!(document = id, status = status.as_str(), error = %e, "status update failed"),
        }
    }

    /// Upload a document's chunks with their vectors in one batch.
    pub async fn upload_chunks(
        &self,
        document_id: &str,
        chunks: &[Chunk],
        embeddings: &[Vec<f32>],
    ) -> Result<(), StoreError> {
        let url = format!("{}/api/chunks/batch", self.api_base());
        let payload = chunk_batch_payload(document_id, chunks, embeddings);
        let response = self.client.post(&url).json(&payload).send().await?;
        if !response.status().is_success() {
            return Err(StoreError::Status {
                status: response.status().as_u16(),
                endpoint: "chunks/batch".to_string(),
            });
        }
        Ok(())
    }

    fn api_base(&self) -> &str {
        self.config.api_base_url.trim_end_matches('/')
    }
}

// ── Wire payloads ────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChunkRecord<'a> {
    id: Uuid,
    chunk_index: usize,
    content: &'a str,
    start_page: u32,
    end_page: u32,
    section_header: Option<&'a str>,
    token_count: usize,
    embedding: &'a [f32],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChunkBatchPayload<'a> {
    document_id: &'a str,
    chunks: Vec<ChunkRecord<'a>>,
}

fn chunk_batch_payload<'a>(
    document_id: &'a str,
    chunks: &'a [Chunk],
    embeddings: &'a [Vec<f32>],
) -> ChunkBatchPayload<'a> {
    ChunkBatchPayload {
        document_id,
        chunks: chunks
            .iter()
            .zip(embeddings.iter())
            .map(|(chunk, embedding)| ChunkRecord {
                id: chunk.id,
                chunk_index: chunk.chunk_index,
                content: &chunk.content,
                start_page: chunk.start_page,
                end_page: chunk.end_page,
                section_header: chunk.section_header.as_deref(),
                token_count: chunk.token_count,
                embedding,
            })
            .collect(),
    }
}

// ── Query construction ───────────────────────────────────────────────────

/// SQL + params for the pending-document selection. Pure so the contract
/// is testable without a server.
pub fn build_pending_query(filter: &DocumentFilter) -> (String, Vec<Value>) {
    let mut sql = String::from(
        "SELECT d.id, d.pmcid, d.pmid, d.study_id, d.filename, d.format, d.object_key, d.status \
         FROM documents d",
    );
    let mut conditions: Vec<&str> = Vec::new();
    let mut params: Vec<Value> = Vec::new();

    if filter.include_errors {
        conditions.push("(d.status = 'pending' OR d.status = 'error')");
    } else {
        conditions.push("d.status = 'pending'");
    }

    if let Some(year) = filter.year {
        sql.push_str(" JOIN studies s ON s.id = d.study_id");
        let (from, to) = publication_range(year, filter.month);
        conditions.push("s.pub_date >= ?");
        conditions.push("s.pub_date <= ?");
        params.push(from.into());
        params.push(to.into());
    }

    sql.push_str(" WHERE ");
    sql.push_str(&conditions.join(" AND "));
    sql.push_str(" ORDER BY d.id");

    if filter.limit > 0 {
        sql.push_str(" LIMIT ?");
        params.push(filter.limit.into());
    }

    (sql, params)
}

fn publication_range(year: i32, month: Option<u32>) -> (String, String) {
    match month {
        Some(month) => {
            let last_day = month_end(year, month);
            (
                format!("{year:04}-{month:02}-01"),
                format!("{year:04}-{month:02}-{last_day:02}"),
            )
        }
        None => (format!("{year:04}-01-01"), format!("{year:04}-12-31")),
    }
}

fn month_end(year: i32, month: u32) -> u32 {
    let first_of_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    };
    first_of_next
        .and_then(|d| d.pred_opt())
        .map(|d| chrono::Datelike::day(&d))
        .unwrap_or(28)
}

// ── Row decoding ─────────────────────────────────────────────────────────

fn document_from_row(row: &Value) -> Result<Document, StoreError> {
    let required = |key: &str| -> Result<String, StoreError> {
        row.get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| StoreError::Row(format!("missing field `{key}`")))
    };
    let optional = |key: &str| row.get(key).and_then(Value::as_str).map(str::to_string);

    let format_raw = required("format")?;
    let format = DocumentFormat::parse(&format_raw)
        .ok_or_else(|| StoreError::Row(format!("unknown document format `{format_raw}`")))?;

    let status_raw = required("status")?;
    let status = DocumentStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::Row(format!("unknown document status `{status_raw}`")))?;

    Ok(Document {
        id: required("id")?,
        pmcid: optional("pmcid"),
        pmid: optional("pmid"),
        study_id: row.get("study_id").and_then(Value::as_i64),
        filename: required("filename")?,
        format,
        object_key: required("object_key")?,
        status,
    })
}
