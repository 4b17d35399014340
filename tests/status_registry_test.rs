//! Integration tests for the status code registry
//!
//! Tests cover:
//! - Stable codes under concurrent first sight
//! - Dense allocation for concurrent distinct codes
//! - Code 0 reserved for the Safaricom success code
//! - Stored messages first, upstream messages when none is stored
//! - Seeding followed by Markdown export
//! - The Postgres store (ignored unless DATABASE_URL points at a test database)

use chrono::{TimeZone, Utc};
use futures::future::join_all;
use mpesa_gateway::status_codes::memory::InMemoryStatusCodeStore;
use mpesa_gateway::status_codes::seed::{seed, SeedEntry};
use mpesa_gateway::status_codes::{
    export, ExternalSystem, StatusCodeMapping, StatusCodeStore, StatusRegistry,
};
use std::collections::HashSet;
use std::sync::Arc;

fn entry(code: &str, message: &str) -> SeedEntry {
    SeedEntry {
        external_code: code.to_string(),
        default_message: message.to_string(),
        is_success: false,
    }
}

async fn assert_concurrent_maps_agree(registry: StatusRegistry) {
    let calls = (0..32).map(|i| {
        let registry = registry.clone();
        let code = if i % 2 == 0 { "1032" } else { "2001" };
        tokio::spawn(async move { registry.map_vendor_status(code, None).await })
    });

    let results: Vec<_> = join_all(calls)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let cancelled: HashSet<i64> = results
        .iter()
        .filter(|m| m.external_code == "1032")
        .map(|m| m.status_code)
        .collect();
    let wrong_pin: HashSet<i64> = results
        .iter()
        .filter(|m| m.external_code == "2001")
        .map(|m| m.status_code)
        .collect();

    assert_eq!(cancelled.len(), 1, "one code per pair");
    assert_eq!(wrong_pin.len(), 1, "one code per pair");
    assert_ne!(cancelled, wrong_pin);
    assert!(!cancelled.contains(&0));
    assert!(!wrong_pin.contains(&0));
}

#[tokio::test]
async fn test_concurrent_first_sight_yields_one_code() {
    let registry = StatusRegistry::new(Arc::new(InMemoryStatusCodeStore::new()));
    assert_concurrent_maps_agree(registry).await;
}

/// K distinct codes seen for the first time at once take exactly 1..=K
async fn assert_distinct_sightings_are_dense(registry: StatusRegistry, k: i64) {
    let calls = (0..k).map(|i| {
        let registry = registry.clone();
        tokio::spawn(async move {
            registry
                .map_vendor_status(&format!("5{:03}", i), Some("first sight"))
                .await
        })
    });

    let mut codes: Vec<i64> = join_all(calls)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap().status_code)
        .collect();
    codes.sort_unstable();
    assert_eq!(codes, (1..=k).collect::<Vec<_>>());

    let success = registry.map_vendor_status("0", None).await.unwrap();
    assert_eq!(success.status_code, 0);
    assert_eq!(registry.list().await.unwrap().len() as i64, k + 1);
}

#[tokio::test]
async fn test_concurrent_distinct_codes_fill_one_to_k() {
    let registry = StatusRegistry::new(Arc::new(InMemoryStatusCodeStore::new()));
    assert_distinct_sightings_are_dense(registry, 20).await;
}

#[tokio::test]
async fn test_empty_stored_message_falls_back_to_upstream() {
    let store = Arc::new(InMemoryStatusCodeStore::new());
    store
        .upsert_exact(StatusCodeMapping {
            external_system: ExternalSystem::Safaricom,
            external_code: "1037".to_string(),
            internal_code: 7,
            default_message: String::new(),
            is_success: false,
        })
        .await
        .unwrap();
    let registry = StatusRegistry::new(store);

    let mapped = registry
        .map_vendor_status("1037", Some("from upstream"))
        .await
        .unwrap();
    assert_eq!(mapped.status_code, 7);
    assert_eq!(mapped.status_message, "from upstream");

    let overridden = registry
        .map(ExternalSystem::Safaricom, "1037", Some("from upstream"), Some("caller default"))
        .await
        .unwrap();
    assert_eq!(overridden.status_message, "caller default");

    let bare = registry.map_vendor_status("1037", None).await.unwrap();
    assert_eq!(bare.status_message, "");
}

#[tokio::test]
async fn test_zero_is_reserved_for_safaricom_success() {
    let registry = StatusRegistry::new(Arc::new(InMemoryStatusCodeStore::new()));

    let gateway_zero = registry
        .map(ExternalSystem::Gateway, "0", None, None)
        .await
        .unwrap();
    assert_ne!(gateway_zero.status_code, 0);
    assert!(!gateway_zero.is_success);

    let success = registry.map_vendor_status("0", Some("ignored")).await.unwrap();
    assert_eq!(success.status_code, 0);
    assert!(success.is_success);
    assert_eq!(success.status_message, "Success");

    let timeout = registry
        .map(ExternalSystem::Gateway, "TIMEOUT", Some("Request timed out"), None)
        .await
        .unwrap();
    assert!(timeout.status_code > gateway_zero.status_code);
}

#[tokio::test]
async fn test_seed_then_export_lists_rows_in_code_order() {
    let store = Arc::new(InMemoryStatusCodeStore::new());
    let report = seed(
        store.as_ref(),
        vec![
            entry("2001", "The initiator information is invalid."),
            entry("1", "The balance is insufficient | top up"),
            entry("1032", "Request cancelled by user"),
        ],
        true,
    )
    .await
    .unwrap();
    assert_eq!(report.created, 3);

    let registry = StatusRegistry::new(store.clone());
    let mapped = registry.map_vendor_status("1032", None).await.unwrap();
    assert_eq!(mapped.status_code, 2);

    let rows = registry.list().await.unwrap();
    let generated_at = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
    let markdown = export::render_markdown(&rows, generated_at);

    assert!(markdown.contains("Last generated: 2026-01-02 03:04:05Z"));
    assert!(markdown.contains("| 0 | safaricom | 0 | Success | yes |"));
    assert!(markdown.contains("| 1 | safaricom | 1 | The balance is insufficient \\| top up | no |"));
    let first = markdown.find("| 1 | safaricom").unwrap();
    let third = markdown.find("| 3 | safaricom").unwrap();
    assert!(first < third);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL pointing at a disposable Postgres database"]
async fn test_postgres_store_allocates_densely_under_concurrency() {
    use mpesa_gateway::database::status_code_repository::StatusCodeRepository;
    use mpesa_gateway::database::{init_pool, run_migrations};

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgresql://localhost/mpesa_gateway_test".to_string());
    let pool = init_pool(&database_url, None)
        .await
        .expect("Failed to create test database pool");
    run_migrations(&pool).await.expect("migrations");

    let store = Arc::new(StatusCodeRepository::new(pool));
    store.delete_system(ExternalSystem::Safaricom).await.unwrap();
    store.delete_system(ExternalSystem::Gateway).await.unwrap();
    assert_distinct_sightings_are_dense(StatusRegistry::new(store.clone()), 20).await;

    store.delete_system(ExternalSystem::Safaricom).await.unwrap();
    assert_concurrent_maps_agree(StatusRegistry::new(store)).await;
}
