//! Integration tests: paginated search feeding the fetch pipeline.

mod common;

use std::sync::Arc;

use common::mock_api::{MockApi, MockSearch, Reply};
use jobfetch_core::config::FetchConfig;
use jobfetch_core::{FetchPipeline, SearchDriver};

#[tokio::test(start_paused = true)]
async fn stops_after_the_page_that_crosses_max_results() {
    let mut cfg = FetchConfig::default();
    cfg.search.max_results = Some(150);
    let search = Arc::new(MockSearch::new(7, 100));

    let out = SearchDriver::from_config(&cfg)
        .unwrap()
        .run("rust developer", Arc::clone(&search))
        .await;

    assert_eq!(search.pages_requested(), vec![0, 1]);
    assert_eq!(out.items.len(), 150);
    assert_eq!(out.items[0], "job-0");
    assert_eq!(out.items[149], "job-149");
    assert_eq!(out.total_pages, 7);
    assert_eq!(out.total_found, 700);
    assert!(out.truncated);
}

#[tokio::test(start_paused = true)]
async fn transient_page_failures_are_retried() {
    let cfg = FetchConfig::default();
    let mut search = MockSearch::new(4, 10);
    search.api = MockApi::healthy()
        .script(&MockSearch::page_key(2), vec![Reply::Status(503), Reply::Timeout]);
    let search = Arc::new(search);

    let out = SearchDriver::from_config(&cfg)
        .unwrap()
        .run("rust", Arc::clone(&search))
        .await;

    assert_eq!(out.items.len(), 40);
    assert!(out.failed_pages.is_empty());
    assert_eq!(search.api.calls_for(&MockSearch::page_key(2)), 3);
    let expected: Vec<String> = (0..40).map(|i| format!("job-{i}")).collect();
    assert_eq!(out.items, expected);
}

#[tokio::test(start_paused = true)]
async fn search_results_feed_the_pipeline() {
    let mut cfg = FetchConfig::default();
    cfg.search.max_results = Some(25);
    let search = Arc::new(MockSearch::new(5, 10));
    let found = SearchDriver::from_config(&cfg)
        .unwrap()
        .run("rust", search)
        .await;
    assert_eq!(found.items.len(), 25);

    let api = Arc::new(MockApi::healthy().script("job-3", vec![Reply::Status(502)]));
    let result = FetchPipeline::new(&cfg)
        .unwrap()
        .run(found.items, Arc::clone(&api))
        .await;

    assert_eq!(result.fetched.len(), 25);
    assert_eq!(api.calls_for("job-3"), 2);
    assert_eq!(result.stats.total_attempts, 26);
}
