use herdsync_core::models::{ConflictChoice, EntityKind, MutationOp, QueueItem};
use herdsync_core::EngineConfig;
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::commands::add::run_add;
use crate::commands::common::{
    format_queue_lines, format_relative_time, open_engine, parse_fields, resolve_target_url,
    Context,
};
use crate::commands::conflicts::run_resolve;
use crate::commands::delete::run_delete;
use crate::commands::edit::run_edit;
use crate::commands::logout::run_logout;
use crate::commands::sync::run_sync;
use crate::error::CliError;

fn context(dir: &TempDir, api_base_url: &str) -> Context {
    Context {
        db_path: dir.path().join("nested").join("herdsync.db"),
        config: EngineConfig {
            api_base_url: api_base_url.to_string(),
            request_timeout_secs: 2,
            ..EngineConfig::default()
        },
    }
}

fn fields(values: &[&str]) -> Vec<String> {
    values.iter().map(ToString::to_string).collect()
}

#[test]
fn parse_fields_keeps_json_types() {
    let payload = parse_fields(
        &fields(&["name=Bessie", "weight_kg=410.5", "pregnant=false", "tag=\"007\""]),
        None,
    )
    .unwrap();

    assert_eq!(payload["name"], json!("Bessie"));
    assert_eq!(payload["weight_kg"], json!(410.5));
    assert_eq!(payload["pregnant"], json!(false));
    assert_eq!(payload["tag"], json!("007"));
}

#[test]
fn parse_fields_overlays_assignments_on_json() {
    let payload = parse_fields(
        &fields(&["breed=Jersey"]),
        Some(r#"{"name": "Daisy", "breed": "Holstein"}"#),
    )
    .unwrap();
    assert_eq!(payload["name"], json!("Daisy"));
    assert_eq!(payload["breed"], json!("Jersey"));
}

#[test]
fn parse_fields_rejects_bad_input() {
    assert!(matches!(parse_fields(&[], None), Err(CliError::EmptyPayload)));
    assert!(matches!(
        parse_fields(&fields(&["no-equals"]), None),
        Err(CliError::InvalidField(_))
    ));
    assert!(matches!(
        parse_fields(&fields(&["=value"]), None),
        Err(CliError::InvalidField(_))
    ));
    assert!(matches!(
        parse_fields(&[], Some("[1, 2]")),
        Err(CliError::PayloadNotObject)
    ));
}

#[test]
fn format_relative_time_units() {
    let now = 10_000_000_000;
    assert_eq!(format_relative_time(now - 30_000, now), "just now");
    assert_eq!(format_relative_time(now - 120_000, now), "2m ago");
    assert_eq!(format_relative_time(now - 2 * 60 * 60_000, now), "2h ago");
    assert_eq!(format_relative_time(now - 3 * 24 * 60 * 60_000, now), "3d ago");
}

#[test]
fn resolve_target_url_joins_paths() {
    assert_eq!(
        resolve_target_url("https://api.herd.test/", "/api/v1/cows").unwrap(),
        "https://api.herd.test/api/v1/cows"
    );
    assert_eq!(
        resolve_target_url("https://api.herd.test", "https://other.test/api/x").unwrap(),
        "https://other.test/api/x"
    );
    assert!(resolve_target_url("https://api.herd.test", "api/v1/cows").is_err());
}

#[test]
fn queue_lines_flag_items_needing_attention() {
    let item = |id: i64, retry_count: u32, rejected: bool| QueueItem {
        id,
        entity_kind: EntityKind::Animal,
        entity_id: format!("cow-{id}"),
        operation: MutationOp::Update,
        payload: serde_json::Map::new(),
        enqueued_at: 0,
        base_updated_at: None,
        revision: 0,
        retry_count,
        last_error: None,
        rejected,
    };
    let lines = format_queue_lines(&[item(1, 0, false), item(2, 5, false), item(3, 1, true)], 5);

    assert!(lines[0].contains("[pending, 0 retries]"));
    assert!(lines[1].contains("[parked, 5 retries]"));
    assert!(lines[2].contains("[rejected, 1 retries]"));
}

#[tokio::test]
async fn local_commands_queue_without_network() {
    let dir = TempDir::new().unwrap();
    // Nothing listens here; local commands must not try it
    let ctx = context(&dir, "http://127.0.0.1:9");

    run_add(
        EntityKind::Animal,
        &fields(&["id=\"cow-1\"", "name=Bessie"]),
        None,
        &ctx,
    )
    .await
    .unwrap();
    run_edit(EntityKind::Animal, "cow-1", &fields(&["weight_kg=410"]), None, &ctx)
        .await
        .unwrap();

    let engine = open_engine(&ctx, false).await.unwrap();
    let queue = engine.list_queue().await.unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].operation, MutationOp::Create);
    assert_eq!(queue[0].payload["weight_kg"], json!(410));

    run_delete(EntityKind::Animal, "cow-1", &ctx).await.unwrap();
    let engine = open_engine(&ctx, false).await.unwrap();
    assert!(engine.list_queue().await.unwrap().is_empty());
    assert!(engine.get(EntityKind::Animal, "cow-1").await.unwrap().is_none());
}

#[tokio::test]
async fn sync_pushes_queued_creates() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/cows"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "cow-1",
            "name": "Bessie",
            "updated_at": 1_700_000_000_000_i64
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let ctx = context(&dir, &server.uri());
    run_add(
        EntityKind::Animal,
        &fields(&["name=Bessie"]),
        Some(r#"{"id": "cow-1"}"#),
        &ctx,
    )
    .await
    .unwrap();

    run_sync(false, &ctx).await.unwrap();

    let engine = open_engine(&ctx, false).await.unwrap();
    assert!(engine.list_queue().await.unwrap().is_empty());
    let record = engine.get(EntityKind::Animal, "cow-1").await.unwrap().unwrap();
    assert!(record.synced);
    assert!(engine.status().last_sync_time.is_some());
}

#[tokio::test]
async fn logout_refuses_to_drop_pending_changes() {
    let dir = TempDir::new().unwrap();
    let ctx = context(&dir, "http://127.0.0.1:9");
    run_add(EntityKind::MilkLog, &fields(&["liters=12.5"]), None, &ctx)
        .await
        .unwrap();

    assert!(matches!(
        run_logout(false, &ctx).await,
        Err(CliError::PendingChanges(1))
    ));

    run_logout(true, &ctx).await.unwrap();
    let engine = open_engine(&ctx, false).await.unwrap();
    assert!(engine.list(EntityKind::MilkLog).await.unwrap().is_empty());
    assert!(engine.list_queue().await.unwrap().is_empty());
}

#[tokio::test]
async fn resolve_requires_a_target() {
    let dir = TempDir::new().unwrap();
    let ctx = context(&dir, "http://127.0.0.1:9");
    assert!(matches!(
        run_resolve(None, false, ConflictChoice::Remote, &ctx).await,
        Err(CliError::MissingConflictTarget)
    ));
}

#[tokio::test]
async fn resolve_leaves_pending_changes_for_sync() {
    let server = MockServer::start().await;
    Mock::given(wiremock::matchers::any())
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    let dir = TempDir::new().unwrap();
    let ctx = context(&dir, &server.uri());
    run_add(EntityKind::Animal, &fields(&["id=\"cow-1\"", "name=Bessie"]), None, &ctx)
        .await
        .unwrap();

    run_resolve(None, true, ConflictChoice::Local, &ctx).await.unwrap();

    let engine = open_engine(&ctx, false).await.unwrap();
    assert_eq!(engine.list_queue().await.unwrap().len(), 1);
    server.verify().await;
}
