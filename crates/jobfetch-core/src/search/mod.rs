//! Paginated search driver.
//!
//! Page 0 is fetched first to learn the declared totals and the page size.
//! Remaining pages go out in bounded windows, never more than are needed to
//! reach `max_results` at the observed page size. Items are appended in page
//! order and the surplus beyond `max_results` is cut.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::{self, JoinSet};

use crate::config::{secs, ConfigError, FetchConfig, SearchConfig};
use crate::dispatch::{ConcurrencyLimit, RunCounters};
use crate::retry::{run_with_retry, AttemptOutcome, FetchError, RetryPolicy};
use crate::source::{PageSearcher, SearchPage};

#[derive(Debug, Clone, PartialEq)]
pub struct SearchOutcome<I> {
    pub items: Vec<I>,
    /// Total matches declared by the upstream.
    pub total_found: u64,
    /// Total pages declared by the upstream.
    pub total_pages: u32,
    pub pages_fetched: u32,
    /// Pages that failed after retries, ascending.
    pub failed_pages: Vec<u32>,
    /// True when items were dropped to honor `max_results`.
    pub truncated: bool,
}

impl<I> SearchOutcome<I> {
    fn first_page_failed() -> Self {
        Self {
            items: Vec::new(),
            total_found: 0,
            total_pages: 0,
            pages_fetched: 0,
            failed_pages: vec![0],
            truncated: false,
        }
    }
}

#[derive(Debug)]
pub struct SearchDriver {
    policy: Arc<RetryPolicy>,
    limit: Arc<ConcurrencyLimit>,
    counters: Arc<RunCounters>,
    max_results: Option<usize>,
    max_pages: Option<u32>,
    window_size: usize,
    window_delay: Duration,
}

impl SearchDriver {
    pub fn new(
        cfg: &SearchConfig,
        max_concurrent: usize,
        policy: Arc<RetryPolicy>,
    ) -> Result<Self, ConfigError> {
        if cfg.window_size == 0 {
            return Err(ConfigError::ZeroWindow);
        }
        Ok(Self {
            policy,
            limit: Arc::new(ConcurrencyLimit::new(max_concurrent)?),
            counters: Arc::new(RunCounters::default()),
            max_results: cfg.max_results,
            max_pages: cfg.max_pages,
            window_size: cfg.window_size,
            window_delay: secs("search.window_delay_secs", cfg.window_delay_secs)?,
        })
    }

    /// Driver using the `[search]` section, `max_concurrent` and the retry policy of `cfg`.
    pub fn from_config(cfg: &FetchConfig) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let policy = Arc::new(RetryPolicy::from_config(&cfg.retry, &cfg.circuit_breaker)?);
        Self::new(&cfg.search, cfg.max_concurrent, policy)
    }

    pub fn with_max_results(mut self, max_results: Option<usize>) -> Self {
        self.max_results = max_results;
        self
    }

    pub fn limit(&self) -> &Arc<ConcurrencyLimit> {
        &self.limit
    }

    pub fn counters(&self) -> &Arc<RunCounters> {
        &self.counters
    }

    pub async fn run<S>(&self, query: &str, searcher: Arc<S>) -> SearchOutcome<S::Item>
    where
        S: PageSearcher,
    {
        let first = match self.fetch_page(query, 0, &searcher).await {
            Ok(page) => page,
            Err(error) => {
                tracing::warn!(query, error = %error, "first search page failed");
                return SearchOutcome::first_page_failed();
            }
        };

        let page_size = first.items.len();
        let total_pages = first.total_pages;
        let page_bound = match self.max_pages {
            Some(max) => total_pages.min(max.max(1)),
            None => total_pages,
        };
        let mut outcome = SearchOutcome {
            items: first.items,
            total_found: first.total_found,
            total_pages,
            pages_fetched: 1,
            failed_pages: Vec::new(),
            truncated: false,
        };
        tracing::info!(
            query,
            total_pages,
            total_found = outcome.total_found,
            page_size,
            "search page 0 fetched"
        );

        let mut next = 1u32;
        while next < page_bound && page_size > 0 && !self.reached(outcome.items.len()) {
            let window = self.window_len(next, page_bound, page_size, outcome.items.len());
            let pages = next..next + window;
            tracing::debug!(query, first = pages.start, last = pages.end - 1, "search window");

            let mut join_set = JoinSet::new();
            let mut pending = HashMap::with_capacity(window as usize);
            for page in pages {
                let driver = self.handle();
                let searcher = Arc::clone(&searcher);
                let query = query.to_string();
                let handle = join_set.spawn(async move {
                    let res = driver.fetch_page_owned(&query, page, &searcher).await;
                    (page, res)
                });
                pending.insert(handle.id(), page);
            }
            let results = collect_window(join_set, pending).await;
            for (page, res) in results {
                match res {
                    Ok(p) => {
                        outcome.pages_fetched += 1;
                        outcome.items.extend(p.items);
                    }
                    Err(error) => {
                        tracing::warn!(query, page, error = %error, "search page failed");
                        outcome.failed_pages.push(page);
                    }
                }
            }

            next += window;
            if next < page_bound && !self.reached(outcome.items.len()) && !self.window_delay.is_zero() {
                tokio::time::sleep(self.window_delay).await;
            }
        }

        if let Some(max) = self.max_results {
            if outcome.items.len() > max {
                outcome.items.truncate(max);
                outcome.truncated = true;
            }
        }
        tracing::info!(
            query,
            items = outcome.items.len(),
            pages_fetched = outcome.pages_fetched,
            failed_pages = outcome.failed_pages.len(),
            "search finished"
        );
        outcome
    }

    fn reached(&self, collected: usize) -> bool {
        self.max_results.map_or(false, |max| collected >= max)
    }

    /// Pages to request next: bounded by the window size, the pages left, and
    /// the pages still needed to reach `max_results`.
    fn window_len(&self, next: u32, page_bound: u32, page_size: usize, collected: usize) -> u32 {
        let mut window = (self.window_size as u32).min(page_bound - next);
        if let Some(max) = self.max_results {
            let missing = max.saturating_sub(collected);
            let needed = missing.div_ceil(page_size).max(1);
            window = window.min(u32::try_from(needed).unwrap_or(u32::MAX));
        }
        window
    }

    fn handle(&self) -> PageFetch {
        PageFetch {
            policy: Arc::clone(&self.policy),
            limit: Arc::clone(&self.limit),
            counters: Arc::clone(&self.counters),
        }
    }

    async fn fetch_page<S>(
        &self,
        query: &str,
        page: u32,
        searcher: &Arc<S>,
    ) -> Result<SearchPage<S::Item>, FetchError>
    where
        S: PageSearcher,
    {
        self.handle().fetch_page_owned(query, page, searcher).await
    }
}

type PageResult<I> = (u32, Result<SearchPage<I>, FetchError>);

/// Wait for every page task of a window and return the results in page order.
/// A task that died before reporting counts as a failed page.
async fn collect_window<I: Send + 'static>(
    mut join_set: JoinSet<PageResult<I>>,
    mut pending: HashMap<task::Id, u32>,
) -> Vec<PageResult<I>> {
    let mut results = Vec::with_capacity(join_set.len());
    while let Some(res) = join_set.join_next_with_id().await {
        match res {
            Ok((task_id, r)) => {
                pending.remove(&task_id);
                results.push(r);
            }
            Err(e) => match pending.remove(&e.id()) {
                Some(page) => {
                    tracing::error!(page, error = %e, "search task died");
                    results.push((page, Err(FetchError::Other(format!("search task failed: {}", e)))));
                }
                None => tracing::error!(error = %e, "search task join for unknown task"),
            },
        }
    }
    results.sort_by_key(|(page, _)| *page);
    results
}

/// What a spawned page task needs from the driver.
struct PageFetch {
    policy: Arc<RetryPolicy>,
    limit: Arc<ConcurrencyLimit>,
    counters: Arc<RunCounters>,
}

impl PageFetch {
    async fn fetch_page_owned<S>(
        &self,
        query: &str,
        page: u32,
        searcher: &Arc<S>,
    ) -> Result<SearchPage<S::Item>, FetchError>
    where
        S: PageSearcher,
    {
        let key = format!("{query}#page{page}");
        let outcome = run_with_retry(&key, &self.policy, &self.limit, &self.counters, || {
            let searcher = Arc::clone(searcher);
            let query = query.to_string();
            async move { searcher.search_page(&query, page).await }
        })
        .await;
        match outcome {
            AttemptOutcome::Fetched { payload, .. } => Ok(payload),
            AttemptOutcome::Failed { error, .. } => Err(error),
        }
    }
}
