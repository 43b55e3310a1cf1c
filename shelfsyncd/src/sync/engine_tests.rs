use std::sync::atomic::AtomicBool;

use serde_json::{Value, json};
use sqlx::SqlitePool;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use super::*;

struct Harness {
    source: MockServer,
    target: MockServer,
    engine: SyncEngine,
    _state_dir: Option<tempfile::TempDir>,
}

async fn harness() -> Harness {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let tracker = TrackerStore::from_pool(pool);
    tracker.init().await.unwrap();
    build_harness(tracker, 1, None).await
}

// An in-memory pool gives every pooled connection its own database, so
// tests that exercise concurrent writes need a file-backed tracker.
async fn harness_with_concurrency(concurrency: usize) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let tracker = TrackerStore::open(&dir.path().join("tracker.db"))
        .await
        .unwrap();
    build_harness(tracker, concurrency, Some(dir)).await
}

async fn build_harness(
    tracker: TrackerStore,
    concurrency: usize,
    state_dir: Option<tempfile::TempDir>,
) -> Harness {
    let source_server = MockServer::start().await;
    let target_server = MockServer::start().await;
    let source = DmsClient::new(&source_server.uri(), "source-token").unwrap();
    let target = WorkspaceClient::new(&target_server.uri(), "target-token").unwrap();
    let engine = SyncEngine::new(
        source,
        target,
        tracker,
        DatabaseIds {
            documents: "db-docs".into(),
            tags: "db-tags".into(),
            correspondents: "db-corr".into(),
        },
    )
    .with_concurrency(concurrency);
    Harness {
        source: source_server,
        target: target_server,
        engine,
        _state_dir: state_dir,
    }
}

impl Harness {
    async fn run(&self) -> CycleStats {
        self.engine
            .run_cycle(&AtomicBool::new(false))
            .await
            .unwrap()
    }

    async fn target_requests(&self, method_name: &str, url_path: &str) -> Vec<Request> {
        self.target
            .received_requests()
            .await
            .unwrap()
            .into_iter()
            .filter(|req| req.method.as_str() == method_name && req.url.path() == url_path)
            .collect()
    }

    async fn source_requests(&self, url_path: &str) -> Vec<Request> {
        self.source
            .received_requests()
            .await
            .unwrap()
            .into_iter()
            .filter(|req| req.url.path() == url_path)
            .collect()
    }
}

fn doc(
    id: i64,
    title: &str,
    modified: &str,
    correspondent: Option<i64>,
    tags: &[i64],
    checksum: Option<&str>,
) -> Value {
    json!({
        "id": id,
        "title": title,
        "created": "2024-01-01T00:00:00Z",
        "added": "2024-01-02T00:00:00Z",
        "modified": modified,
        "correspondent": correspondent,
        "tags": tags,
        "checksum": checksum,
        "original_file_name": format!("doc-{id}.pdf")
    })
}

async fn mount_listing(server: &MockServer, endpoint: &str, results: Value) {
    Mock::given(method("GET"))
        .and(path(endpoint))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "count": results.as_array().map(Vec::len).unwrap_or(0),
            "next": null,
            "results": results
        })))
        .mount(server)
        .await;
}

async fn mount_empty_reference_listings(server: &MockServer) {
    mount_listing(server, "/api/correspondents/", json!([])).await;
    mount_listing(server, "/api/tags/", json!([])).await;
}

async fn mount_download(server: &MockServer, id: i64) {
    Mock::given(method("GET"))
        .and(path(format!("/api/documents/{id}/download/")))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"%PDF-1.4")
                .insert_header(
                    "content-disposition",
                    format!("attachment; filename=\"scan-{id}.pdf\"").as_str(),
                ),
        )
        .mount(server)
        .await;
}

async fn mount_query(server: &MockServer, database_id: &str, results: Value) {
    Mock::given(method("POST"))
        .and(path(format!("/v1/databases/{database_id}/query")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "results": results })))
        .mount(server)
        .await;
}

async fn mount_create(server: &MockServer, page_id: &str) {
    Mock::given(method("POST"))
        .and(path("/v1/pages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": page_id })))
        .mount(server)
        .await;
}

async fn mount_patch(server: &MockServer, page_id: &str) {
    Mock::given(method("PATCH"))
        .and(path(format!("/v1/pages/{page_id}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": page_id })))
        .mount(server)
        .await;
}

async fn mount_attach(server: &MockServer, page_id: &str) {
    Mock::given(method("POST"))
        .and(path(format!("/v1/pages/{page_id}/files")))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}

#[tokio::test]
async fn creates_document_with_resolved_relations() {
    let h = harness().await;
    mount_empty_reference_listings(&h.source).await;
    mount_listing(
        &h.source,
        "/api/documents/",
        json!([doc(42, "Invoice March", "2024-01-03T00:00:00Z", Some(7), &[1, 2], Some("c1"))]),
    )
    .await;
    mount_download(&h.source, 42).await;
    mount_query(&h.target, "db-docs", json!([])).await;
    mount_create(&h.target, "page-42").await;
    mount_attach(&h.target, "page-42").await;

    h.engine
        .tracker
        .put(EntityType::Correspondent, 7, "ACME", None, "corr-7")
        .await
        .unwrap();
    h.engine
        .tracker
        .put(EntityType::Tag, 1, "a|", None, "tag-1")
        .await
        .unwrap();
    h.engine
        .tracker
        .put(EntityType::Tag, 2, "b|", None, "tag-2")
        .await
        .unwrap();

    let stats = h.run().await;
    assert_eq!(stats.created, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.skipped, 0);

    let state = h
        .engine
        .tracker
        .get(EntityType::Document, 42)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.target_id, "page-42");
    assert_eq!(state.marker, "2024-01-03T00:00:00Z");
    assert_eq!(state.content_marker.as_deref(), Some("c1"));
    assert!(!state.archived);

    let creates = h.target_requests("POST", "/v1/pages").await;
    assert_eq!(creates.len(), 1);
    let body: Value = serde_json::from_slice(&creates[0].body).unwrap();
    assert_eq!(body["parent"]["database_id"], "db-docs");
    assert_eq!(body["properties"]["Correspondent"]["relation"][0]["id"], "corr-7");
    assert_eq!(body["properties"]["Tags"]["relation"][0]["id"], "tag-1");
    assert_eq!(body["properties"]["Tags"]["relation"][1]["id"], "tag-2");

    let uploads = h.target_requests("POST", "/v1/pages/page-42/files").await;
    assert_eq!(uploads.len(), 1);
    let upload_body = String::from_utf8_lossy(&uploads[0].body).to_string();
    assert!(upload_body.contains("scan-42.pdf"));
}

#[tokio::test]
async fn second_cycle_issues_no_target_writes() {
    let h = harness().await;
    mount_listing(
        &h.source,
        "/api/correspondents/",
        json!([{ "id": 7, "name": "ACME" }]),
    )
    .await;
    mount_listing(
        &h.source,
        "/api/tags/",
        json!([{ "id": 1, "name": "invoices", "color": "#a6cee3" }]),
    )
    .await;
    mount_listing(
        &h.source,
        "/api/documents/",
        json!([doc(42, "Invoice March", "2024-01-03T00:00:00Z", Some(7), &[1], Some("c1"))]),
    )
    .await;
    mount_download(&h.source, 42).await;
    mount_query(&h.target, "db-corr", json!([])).await;
    mount_query(&h.target, "db-tags", json!([])).await;
    mount_query(&h.target, "db-docs", json!([])).await;
    mount_create(&h.target, "page-1").await;
    mount_attach(&h.target, "page-1").await;

    let first = h.run().await;
    assert_eq!(first.created, 3);
    assert_eq!(first.writes(), 3);
    let requests_after_first = h.target.received_requests().await.unwrap().len();

    let second = h.run().await;
    assert_eq!(second.writes(), 0);
    assert_eq!(second.unchanged, 3);
    let requests_after_second = h.target.received_requests().await.unwrap().len();
    assert_eq!(requests_after_first, requests_after_second);
}

#[tokio::test]
async fn updates_document_when_marker_changes() {
    let h = harness().await;
    mount_empty_reference_listings(&h.source).await;
    mount_listing(
        &h.source,
        "/api/documents/",
        json!([doc(42, "Invoice March (fixed)", "2024-02-01T00:00:00Z", None, &[], Some("c1"))]),
    )
    .await;
    mount_patch(&h.target, "page-42").await;

    h.engine
        .tracker
        .put(
            EntityType::Document,
            42,
            "2024-01-03T00:00:00Z",
            Some("c1"),
            "page-42",
        )
        .await
        .unwrap();

    let stats = h.run().await;
    assert_eq!(stats.updated, 1);
    assert_eq!(stats.created, 0);

    let state = h
        .engine
        .tracker
        .get(EntityType::Document, 42)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.marker, "2024-02-01T00:00:00Z");

    let patches = h.target_requests("PATCH", "/v1/pages/page-42").await;
    assert_eq!(patches.len(), 1);
    let body: Value = serde_json::from_slice(&patches[0].body).unwrap();
    assert_eq!(
        body["properties"]["Title"]["title"][0]["text"]["content"],
        "Invoice March (fixed)"
    );

    // Unchanged checksum: no duplicate create and no file re-upload.
    assert!(h.target_requests("POST", "/v1/pages").await.is_empty());
    assert!(h.source_requests("/api/documents/42/download/").await.is_empty());
}

#[tokio::test]
async fn reuploads_file_only_when_checksum_changes() {
    let h = harness().await;
    mount_empty_reference_listings(&h.source).await;
    mount_listing(
        &h.source,
        "/api/documents/",
        json!([doc(42, "Invoice March", "2024-01-03T00:00:00Z", None, &[], Some("c2"))]),
    )
    .await;
    mount_download(&h.source, 42).await;
    mount_attach(&h.target, "page-42").await;

    h.engine
        .tracker
        .put(
            EntityType::Document,
            42,
            "2024-01-03T00:00:00Z",
            Some("c1"),
            "page-42",
        )
        .await
        .unwrap();

    let stats = h.run().await;
    assert_eq!(stats.updated, 1);

    // Metadata marker is unchanged: file replaced, properties untouched.
    assert_eq!(h.target_requests("POST", "/v1/pages/page-42/files").await.len(), 1);
    assert!(h.target_requests("PATCH", "/v1/pages/page-42").await.is_empty());
    let state = h
        .engine
        .tracker
        .get(EntityType::Document, 42)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.content_marker.as_deref(), Some("c2"));
}

#[tokio::test]
async fn archives_documents_missing_from_listing() {
    let h = harness().await;
    mount_empty_reference_listings(&h.source).await;
    mount_listing(
        &h.source,
        "/api/documents/",
        json!([
            doc(10, "Ten", "m", None, &[], None),
            doc(11, "Eleven", "m", None, &[], None)
        ]),
    )
    .await;
    mount_patch(&h.target, "page-12").await;

    for (id, page) in [(10, "page-10"), (11, "page-11"), (12, "page-12")] {
        h.engine
            .tracker
            .put(EntityType::Document, id, "m", None, page)
            .await
            .unwrap();
    }

    let stats = h.run().await;
    assert_eq!(stats.archived, 1);
    assert_eq!(stats.unchanged, 2);

    let patches = h.target_requests("PATCH", "/v1/pages/page-12").await;
    assert_eq!(patches.len(), 1);
    let body: Value = serde_json::from_slice(&patches[0].body).unwrap();
    assert_eq!(body, json!({ "archived": true }));
    assert!(h.target_requests("PATCH", "/v1/pages/page-10").await.is_empty());
    assert!(h.target_requests("PATCH", "/v1/pages/page-11").await.is_empty());

    let state = h
        .engine
        .tracker
        .get(EntityType::Document, 12)
        .await
        .unwrap()
        .unwrap();
    assert!(state.archived);
    assert_eq!(state.target_id, "page-12");
}

#[tokio::test]
async fn reappearing_document_is_unarchived_not_recreated() {
    let h = harness().await;
    mount_empty_reference_listings(&h.source).await;
    mount_listing(
        &h.source,
        "/api/documents/",
        json!([doc(12, "Twelve", "m1", None, &[], None)]),
    )
    .await;
    mount_patch(&h.target, "page-12").await;

    h.engine
        .tracker
        .put(EntityType::Document, 12, "m1", None, "page-12")
        .await
        .unwrap();
    h.engine
        .tracker
        .set_archived(EntityType::Document, 12, true)
        .await
        .unwrap();

    let stats = h.run().await;
    assert_eq!(stats.updated, 1);
    assert_eq!(stats.created, 0);
    assert!(h.target_requests("POST", "/v1/pages").await.is_empty());

    let patches = h.target_requests("PATCH", "/v1/pages/page-12").await;
    let bodies: Vec<Value> = patches
        .iter()
        .map(|req| serde_json::from_slice(&req.body).unwrap())
        .collect();
    assert!(bodies.contains(&json!({ "archived": false })));

    let state = h
        .engine
        .tracker
        .get(EntityType::Document, 12)
        .await
        .unwrap()
        .unwrap();
    assert!(!state.archived);
}

#[tokio::test]
async fn document_with_unresolved_correspondent_is_skipped() {
    let h = harness().await;
    mount_empty_reference_listings(&h.source).await;
    mount_listing(
        &h.source,
        "/api/documents/",
        json!([doc(42, "Invoice March", "m1", Some(7), &[], Some("c1"))]),
    )
    .await;

    let stats = h.run().await;
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.created, 0);
    assert_eq!(stats.failed, 0);

    assert!(h.target.received_requests().await.unwrap().is_empty());
    assert!(
        h.engine
            .tracker
            .get(EntityType::Document, 42)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn one_failing_record_does_not_abort_the_listing() {
    let h = harness().await;
    mount_empty_reference_listings(&h.source).await;
    mount_listing(
        &h.source,
        "/api/documents/",
        json!([
            doc(1, "One", "m1", None, &[], Some("c1")),
            doc(2, "Two", "m1", None, &[], Some("c2"))
        ]),
    )
    .await;
    mount_download(&h.source, 1).await;
    mount_download(&h.source, 2).await;
    mount_query(&h.target, "db-docs", json!([])).await;
    // First create attempt fails, the next succeeds.
    Mock::given(method("POST"))
        .and(path("/v1/pages"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .up_to_n_times(1)
        .mount(&h.target)
        .await;
    mount_create(&h.target, "page-ok").await;
    mount_attach(&h.target, "page-ok").await;

    let stats = h.run().await;
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.created, 1);

    assert!(
        h.engine
            .tracker
            .get(EntityType::Document, 1)
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        h.engine
            .tracker
            .get(EntityType::Document, 2)
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn adopts_existing_target_page_instead_of_creating() {
    let h = harness().await;
    mount_empty_reference_listings(&h.source).await;
    mount_listing(
        &h.source,
        "/api/documents/",
        json!([doc(42, "Invoice March", "m1", None, &[], Some("c1"))]),
    )
    .await;
    mount_download(&h.source, 42).await;
    mount_query(&h.target, "db-docs", json!([{ "id": "page-9" }])).await;
    mount_patch(&h.target, "page-9").await;
    mount_attach(&h.target, "page-9").await;

    let stats = h.run().await;
    assert_eq!(stats.updated, 1);
    assert_eq!(stats.created, 0);
    assert!(h.target_requests("POST", "/v1/pages").await.is_empty());

    let state = h
        .engine
        .tracker
        .get(EntityType::Document, 42)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.target_id, "page-9");
}

#[tokio::test]
async fn updates_tag_when_its_fields_change() {
    let h = harness().await;
    mount_listing(&h.source, "/api/correspondents/", json!([])).await;
    mount_listing(
        &h.source,
        "/api/tags/",
        json!([{ "id": 1, "name": "invoices", "color": "#ff0000" }]),
    )
    .await;
    mount_listing(&h.source, "/api/documents/", json!([])).await;
    mount_patch(&h.target, "tag-1").await;

    h.engine
        .tracker
        .put(EntityType::Tag, 1, "invoices|#a6cee3", None, "tag-1")
        .await
        .unwrap();

    let stats = h.run().await;
    assert_eq!(stats.updated, 1);

    let state = h
        .engine
        .tracker
        .get(EntityType::Tag, 1)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.marker, "invoices|#ff0000");
}

#[tokio::test]
async fn concurrent_document_writes_all_complete() {
    let h = harness_with_concurrency(4).await;
    mount_empty_reference_listings(&h.source).await;
    let docs: Vec<Value> = (1..=5)
        .map(|id| {
            doc(
                id,
                &format!("Document {id}"),
                "2024-01-03T00:00:00Z",
                None,
                &[],
                Some("c1"),
            )
        })
        .collect();
    mount_listing(&h.source, "/api/documents/", Value::Array(docs)).await;
    for id in 1..=5 {
        mount_download(&h.source, id).await;
    }
    mount_query(&h.target, "db-docs", json!([])).await;
    mount_create(&h.target, "page-bulk").await;
    mount_attach(&h.target, "page-bulk").await;

    let stats = h.run().await;
    assert_eq!(stats.created, 5);
    assert_eq!(stats.failed, 0);

    for id in 1..=5 {
        let state = h
            .engine
            .tracker
            .get(EntityType::Document, id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.target_id, "page-bulk");
        assert!(!state.archived);
    }
    assert_eq!(h.target_requests("POST", "/v1/pages").await.len(), 5);
}

#[tokio::test]
async fn transient_listing_failure_is_retried_within_the_cycle() {
    let h = harness().await;
    mount_empty_reference_listings(&h.source).await;
    // First listing attempt fails with a transient error, the retry succeeds.
    Mock::given(method("GET"))
        .and(path("/api/documents/"))
        .respond_with(ResponseTemplate::new(503).set_body_string("warming up"))
        .up_to_n_times(1)
        .mount(&h.source)
        .await;
    mount_listing(
        &h.source,
        "/api/documents/",
        json!([doc(42, "Invoice March", "m1", None, &[], Some("c1"))]),
    )
    .await;
    mount_download(&h.source, 42).await;
    mount_query(&h.target, "db-docs", json!([])).await;
    mount_create(&h.target, "page-42").await;
    mount_attach(&h.target, "page-42").await;

    let stats = h.run().await;
    assert_eq!(stats.created, 1);
    assert_eq!(h.source_requests("/api/documents/").await.len(), 2);
}

#[test]
fn listing_retry_delay_stays_within_the_backoff_cap() {
    for attempt in 0..=10 {
        assert!(listing_retry_delay(attempt) <= LISTING_BACKOFF_MAX);
    }
}

#[tokio::test]
async fn failed_document_listing_skips_the_archive_scan() {
    let h = harness().await;
    mount_empty_reference_listings(&h.source).await;
    Mock::given(method("GET"))
        .and(path("/api/documents/"))
        .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
        .mount(&h.source)
        .await;

    h.engine
        .tracker
        .put(EntityType::Document, 12, "m1", None, "page-12")
        .await
        .unwrap();

    let stats = h.run().await;
    assert_eq!(stats.archived, 0);
    assert!(h.target.received_requests().await.unwrap().is_empty());

    let state = h
        .engine
        .tracker
        .get(EntityType::Document, 12)
        .await
        .unwrap()
        .unwrap();
    assert!(!state.archived);
}

#[tokio::test]
async fn stop_flag_ends_cycle_between_entity_types() {
    let h = harness().await;
    mount_listing(
        &h.source,
        "/api/correspondents/",
        json!([{ "id": 7, "name": "ACME" }]),
    )
    .await;
    mount_listing(
        &h.source,
        "/api/tags/",
        json!([{ "id": 1, "name": "invoices", "color": null }]),
    )
    .await;
    mount_query(&h.target, "db-corr", json!([])).await;
    mount_create(&h.target, "page-corr").await;

    let stop = AtomicBool::new(true);
    let stats = h.engine.run_cycle(&stop).await.unwrap();

    // The entity type in flight completes; later ones wait for the next cycle.
    assert_eq!(stats.created, 1);
    assert!(h.source_requests("/api/tags/").await.is_empty());
    assert!(h.source_requests("/api/documents/").await.is_empty());
}
