//! Scripted in-memory job API for integration tests.
//!
//! Each identifier has a list of replies consumed one per call; once the list
//! is exhausted the default reply is used. The API records every call and the
//! highest number of calls it saw in flight at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use jobfetch_core::{FetchError, PageSearcher, RecordFetcher, SearchPage};
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub enum Reply {
    Ok,
    Status(u16),
    RateLimited(Option<Duration>),
    Timeout,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Posting {
    pub id: String,
    pub title: String,
}

pub struct MockApi {
    script: HashMap<String, Vec<Reply>>,
    default: Reply,
    latency: Duration,
    calls: Mutex<Vec<(String, Instant)>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl MockApi {
    /// Every call succeeds.
    pub fn healthy() -> Self {
        Self::with_default(Reply::Ok)
    }

    /// Every unscripted call gets `default`.
    pub fn with_default(default: Reply) -> Self {
        Self {
            script: HashMap::new(),
            default,
            latency: Duration::from_millis(20),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Replies for the first calls on `id`, in order.
    pub fn script(mut self, id: &str, replies: Vec<Reply>) -> Self {
        self.script.insert(id.to_string(), replies);
        self
    }

    pub fn calls_for(&self, id: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|(c, _)| c == id).count()
    }

    pub fn call_times(&self, id: &str) -> Vec<Instant> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c == id)
            .map(|(_, at)| *at)
            .collect()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_reply(&self, id: &str) -> Reply {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((id.to_string(), Instant::now()));
            calls.iter().filter(|(c, _)| c == id).count()
        };
        self.script
            .get(id)
            .and_then(|replies| replies.get(n - 1))
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }

    async fn serve(&self, id: &str) -> Result<(), FetchError> {
        let reply = self.next_reply(id);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        match reply {
            Reply::Ok => Ok(()),
            Reply::Status(code) => Err(FetchError::status(code, "scripted")),
            Reply::RateLimited(retry_after) => Err(FetchError::RateLimited { retry_after }),
            Reply::Timeout => Err(FetchError::Timeout),
        }
    }
}

#[async_trait]
impl RecordFetcher for MockApi {
    type Payload = Posting;

    async fn fetch_one(&self, id: &str) -> Result<Posting, FetchError> {
        self.serve(id).await?;
        Ok(Posting {
            id: id.to_string(),
            title: format!("Posting {id}"),
        })
    }
}

/// Search endpoint declaring `total_pages` pages of `page_size` postings each.
pub struct MockSearch {
    pub total_pages: u32,
    pub page_size: usize,
    pub api: MockApi,
}

impl MockSearch {
    pub fn new(total_pages: u32, page_size: usize) -> Self {
        Self {
            total_pages,
            page_size,
            api: MockApi::healthy(),
        }
    }

    pub fn page_key(page: u32) -> String {
        format!("page-{page}")
    }

    /// Pages requested at least once, ascending.
    pub fn pages_requested(&self) -> Vec<u32> {
        (0..self.total_pages)
            .filter(|p| self.api.calls_for(&Self::page_key(*p)) > 0)
            .collect()
    }
}

#[async_trait]
impl PageSearcher for MockSearch {
    type Item = String;

    async fn search_page(&self, _query: &str, page: u32) -> Result<SearchPage<String>, FetchError> {
        self.api.serve(&Self::page_key(page)).await?;
        let first = page as usize * self.page_size;
        Ok(SearchPage {
            items: (first..first + self.page_size).map(|i| format!("job-{i}")).collect(),
            total_pages: self.total_pages,
            total_found: self.total_pages as u64 * self.page_size as u64,
        })
    }
}
