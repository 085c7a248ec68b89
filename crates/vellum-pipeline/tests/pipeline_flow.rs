//! End-to-end pipeline tests against mocked remote endpoints.
//!
//! The metadata store and data-plane API are httpmock servers; the
//! embedder is a stub that returns unit vectors. Everything else — the
//! batch loop, status protocol, extraction, chunking, checkpointing —
//! is the real code path.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use httpmock::{Method, MockServer};
use serde_json::json;

use vellum_pipeline::checkpoint::{load_checkpoint, RunStats, StatsTracker};
use vellum_pipeline::chunker::ChunkerConfig;
use vellum_pipeline::pipeline::{BatchProcessor, PipelineConfig, TextEmbedder};
use vellum_pipeline::store::{RemoteStore, StoreConfig};

const STUB_DIM: usize = 8;

struct StubEmbedder;

#[async_trait]
impl TextEmbedder for StubEmbedder {
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|_| {
                let mut v = vec![0.0f32; STUB_DIM];
                v[0] = 1.0;
                v
            })
            .collect())
    }

    fn dimension(&self) -> usize {
        STUB_DIM
    }
}

/// An embedder that always drops one vector, to exercise the mismatch path.
struct ShortEmbedder;

#[async_trait]
impl TextEmbedder for ShortEmbedder {
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .skip(1)
            .map(|_| vec![1.0f32; STUB_DIM])
            .collect())
    }

    fn dimension(&self) -> usize {
        STUB_DIM
    }
}

const ARTICLE: &str = r#"<article>
  <front><article-meta>
    <title-group><article-title>A minimal article</article-title></title-group>
    <abstract><p>Background and aims of the study.</p></abstract>
  </article-meta></front>
  <body>
    <sec><title>Introduction</title><p>Chunking long documents requires care. Budgets bound every chunk.</p></sec>
    <sec><title>Results</title><p>The pipeline processed every pending document. Failures were isolated.</p></sec>
  </body>
</article>"#;

fn jats_archive_bytes() -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    let data = ARTICLE.as_bytes();
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, "PMC900/PMC900.nxml", data)
        .unwrap();
    builder.into_inner().unwrap().finish().unwrap()
}

fn document_row(id: &str) -> serde_json::Value {
    json!({
        "id": id,
        "pmcid": "PMC900",
        "pmid": "12345",
        "study_id": 7,
        "filename": format!("{id}.tgz"),
        "format": "xml",
        "object_key": format!("docs/{id}.tgz"),
        "status": "pending"
    })
}

fn store_for(server: &MockServer) -> Arc<RemoteStore> {
    Arc::new(
        RemoteStore::new(StoreConfig {
            api_base_url: server.base_url(),
            control_api_url: server.base_url(),
            account_id: "acct".to_string(),
            api_token: "token".to_string(),
            database_id: "db".to_string(),
        })
        .unwrap(),
    )
}

fn processor_for(
    server: &MockServer,
    embedder: Arc<dyn TextEmbedder>,
    limit: usize,
    workers: usize,
    scratch: &std::path::Path,
) -> BatchProcessor {
    let config = PipelineConfig {
        limit,
        workers,
        checkpoint_path: scratch.join("checkpoint.json"),
        data_dir: scratch.to_path_buf(),
        batch_pause: Duration::from_millis(0),
        ..Default::default()
    };
    BatchProcessor::new(
        store_for(server),
        embedder,
        ChunkerConfig::default(),
        config,
        Arc::new(StatsTracker::new(RunStats::new())),
    )
}

const QUERY_PATH: &str = "/client/v4/accounts/acct/d1/database/db/query";

#[tokio::test(flavor = "multi_thread")]
async fn batch_processes_pending_documents_to_ready() {
    let server = MockServer::start_async().await;
    let scratch = tempfile::tempdir().unwrap();
    let archive = jats_archive_bytes();

    let select_mock = server.mock(|when, then| {
        when.method(Method::POST)
            .path(QUERY_PATH)
            .body_contains("SELECT");
        then.status(200).json_body(json!({
            "success": true,
            "result": [{ "results": [document_row("doc-1"), document_row("doc-2")] }]
        }));
    });
    let study_mock = server.mock(|when, then| {
        when.method(Method::POST)
            .path(QUERY_PATH)
            .body_contains("UPDATE studies");
        then.status(200)
            .json_body(json!({ "success": true, "result": [{ "results": [] }] }));
    });

    for id in ["doc-1", "doc-2"] {
        let body = archive.clone();
        server.mock(move |when, then| {
            when.method(Method::GET)
                .path(format!("/api/documents/{id}/content"));
            then.status(200).body(body.clone());
        });
    }

    let processing_mock = server.mock(|when, then| {
        when.method(Method::PATCH)
            .path_contains("/status")
            .body_contains("processing");
        then.status(200);
    });
    let ready_mock = server.mock(|when, then| {
        when.method(Method::PATCH)
            .path_contains("/status")
            .body_contains("ready");
        then.status(200);
    });
    let upload_mock = server.mock(|when, then| {
        when.method(Method::POST).path("/api/chunks/batch");
        then.status(200);
    });

    let processor = processor_for(&server, Arc::new(StubEmbedder), 2, 2, scratch.path());
    let stats = processor.run().await.unwrap();

    assert_eq!(stats.documents_processed, 2);
    assert_eq!(stats.documents_failed, 0);
    assert!(stats.chunks_created >= 2);
    assert_eq!(stats.chunks_created, stats.vectors_uploaded);

    select_mock.assert_hits(1);
    processing_mock.assert_hits(2);
    ready_mock.assert_hits(2);
    upload_mock.assert_hits(2);
    study_mock.assert_hits(2);

    // checkpoint reflects the completed run
    let checkpoint = load_checkpoint(&scratch.path().join("checkpoint.json"))
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.documents_processed, 2);
    assert!(checkpoint.last_document_id.is_some());

    // scratch files are cleaned up
    let leftovers: Vec<_> = std::fs::read_dir(scratch.path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "tgz"))
        .collect();
    assert!(leftovers.is_empty(), "downloaded files were not removed");
}

#[tokio::test(flavor = "multi_thread")]
async fn download_failure_marks_error_and_spares_the_rest() {
    let server = MockServer::start_async().await;
    let scratch = tempfile::tempdir().unwrap();
    let archive = jats_archive_bytes();

    server.mock(|when, then| {
        when.method(Method::POST)
            .path(QUERY_PATH)
            .body_contains("SELECT");
        then.status(200).json_body(json!({
            "success": true,
            "result": [{ "results": [document_row("doc-ok"), document_row("doc-bad")] }]
        }));
    });
    server.mock(|when, then| {
        when.method(Method::POST)
            .path(QUERY_PATH)
            .body_contains("UPDATE studies");
        then.status(200)
            .json_body(json!({ "success": true, "result": [{ "results": [] }] }));
    });
    server.mock(move |when, then| {
        when.method(Method::GET).path("/api/documents/doc-ok/content");
        then.status(200).body(archive.clone());
    });
    server.mock(|when, then| {
        when.method(Method::GET).path("/api/documents/doc-bad/content");
        then.status(404);
    });
    server.mock(|when, then| {
        when.method(Method::PATCH)
            .path_contains("/status")
            .body_contains("processing");
        then.status(200);
    });
    let error_mock = server.mock(|when, then| {
        when.method(Method::PATCH)
            .path("/api/documents/doc-bad/status")
            .body_contains("Download failed");
        then.status(200);
    });
    let ready_mock = server.mock(|when, then| {
        when.method(Method::PATCH)
            .path("/api/documents/doc-ok/status")
            .body_contains("ready");
        then.status(200);
    });
    server.mock(|when, then| {
        when.method(Method::POST).path("/api/chunks/batch");
        then.status(200);
    });

    let processor = processor_for(&server, Arc::new(StubEmbedder), 2, 1, scratch.path());
    let stats = processor.run().await.unwrap();

    assert_eq!(stats.documents_processed, 1);
    assert_eq!(stats.documents_failed, 1);
    error_mock.assert_hits(1);
    ready_mock.assert_hits(1);
}

#[tokio::test(flavor = "multi_thread")]
async fn embedding_mismatch_is_a_document_error() {
    let server = MockServer::start_async().await;
    let scratch = tempfile::tempdir().unwrap();
    let archive = jats_archive_bytes();

    server.mock(|when, then| {
        when.method(Method::POST)
            .path(QUERY_PATH)
            .body_contains("SELECT");
        then.status(200).json_body(json!({
            "success": true,
            "result": [{ "results": [document_row("doc-1")] }]
        }));
    });
    server.mock(move |when, then| {
        when.method(Method::GET).path("/api/documents/doc-1/content");
        then.status(200).body(archive.clone());
    });
    server.mock(|when, then| {
        when.method(Method::PATCH)
            .path_contains("/status")
            .body_contains("processing");
        then.status(200);
    });
    let mismatch_mock = server.mock(|when, then| {
        when.method(Method::PATCH)
            .path("/api/documents/doc-1/status")
            .body_contains("Embedding generation mismatch");
        then.status(200);
    });
    let upload_mock = server.mock(|when, then| {
        when.method(Method::POST).path("/api/chunks/batch");
        then.status(200);
    });

    let processor = processor_for(&server, Arc::new(ShortEmbedder), 1, 1, scratch.path());
    let stats = processor.run().await.unwrap();

    assert_eq!(stats.documents_processed, 0);
    assert_eq!(stats.documents_failed, 1);
    mismatch_mock.assert_hits(1);
    upload_mock.assert_hits(0);
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_extraction_is_a_document_error() {
    let server = MockServer::start_async().await;
    let scratch = tempfile::tempdir().unwrap();

    // well-formed archive, but the article has no text at all
    let empty_article = "<article><body></body></article>";
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    let mut header = tar::Header::new_gnu();
    header.set_size(empty_article.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, "PMC1/PMC1.nxml", empty_article.as_bytes())
        .unwrap();
    let archive = builder.into_inner().unwrap().finish().unwrap();

    server.mock(|when, then| {
        when.method(Method::POST)
            .path(QUERY_PATH)
            .body_contains("SELECT");
        then.status(200).json_body(json!({
            "success": true,
            "result": [{ "results": [document_row("doc-1")] }]
        }));
    });
    server.mock(move |when, then| {
        when.method(Method::GET).path("/api/documents/doc-1/content");
        then.status(200).body(archive.clone());
    });
    server.mock(|when, then| {
        when.method(Method::PATCH)
            .path_contains("/status")
            .body_contains("processing");
        then.status(200);
    });
    let extraction_error_mock = server.mock(|when, then| {
        when.method(Method::PATCH)
            .path("/api/documents/doc-1/status")
            .body_contains("Text extraction failed (xml)");
        then.status(200);
    });

    let processor = processor_for(&server, Arc::new(StubEmbedder), 1, 1, scratch.path());
    let stats = processor.run().await.unwrap();

    assert_eq!(stats.documents_failed, 1);
    extraction_error_mock.assert_hits(1);
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_fetch_ends_the_run_immediately() {
    let server = MockServer::start_async().await;
    let scratch = tempfile::tempdir().unwrap();

    let select_mock = server.mock(|when, then| {
        when.method(Method::POST)
            .path(QUERY_PATH)
            .body_contains("SELECT");
        then.status(200)
            .json_body(json!({ "success": true, "result": [{ "results": [] }] }));
    });

    let processor = processor_for(&server, Arc::new(StubEmbedder), 0, 4, scratch.path());
    let stats = processor.run().await.unwrap();

    assert_eq!(stats.attempted(), 0);
    select_mock.assert_hits(1);
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_store_aborts_the_run() {
    let scratch = tempfile::tempdir().unwrap();
    let store = Arc::new(
        RemoteStore::new(StoreConfig {
            api_base_url: "http://127.0.0.1:1/".to_string(),
            control_api_url: "http://127.0.0.1:1/".to_string(),
            account_id: "acct".to_string(),
            api_token: "token".to_string(),
            database_id: "db".to_string(),
        })
        .unwrap(),
    );
    let config = PipelineConfig {
        limit: 1,
        checkpoint_path: scratch.path().join("checkpoint.json"),
        data_dir: scratch.path().to_path_buf(),
        ..Default::default()
    };
    let processor = BatchProcessor::new(
        store,
        Arc::new(StubEmbedder),
        ChunkerConfig::default(),
        config,
        Arc::new(StatsTracker::new(RunStats::new())),
    );

    assert!(processor.run().await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn dry_run_listing_matches_the_fetch() {
    let server = MockServer::start_async().await;
    let scratch = tempfile::tempdir().unwrap();

    server.mock(|when, then| {
        when.method(Method::POST)
            .path(QUERY_PATH)
            .body_contains("SELECT");
        then.status(200).json_body(json!({
            "success": true,
            "result": [{ "results": [document_row("doc-1"), document_row("doc-2")] }]
        }));
    });

    let processor = processor_for(&server, Arc::new(StubEmbedder), 0, 1, scratch.path());
    let documents = processor.list_pending().await.unwrap();
    assert_eq!(documents.len(), 2);
    assert_eq!(documents[0].id, "doc-1");
    assert_eq!(documents[0].pmcid.as_deref(), Some("PMC900"));
}
