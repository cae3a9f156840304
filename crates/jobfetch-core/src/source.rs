//! Caller-implemented upstream operations.
//!
//! The engine never talks HTTP itself: callers wrap their client in one of
//! these traits and map transport failures onto [`FetchError`].

use async_trait::async_trait;

use crate::retry::FetchError;

/// Fetches one record by identifier.
#[async_trait]
pub trait RecordFetcher: Send + Sync + 'static {
    type Payload: Send + 'static;

    async fn fetch_one(&self, id: &str) -> Result<Self::Payload, FetchError>;
}

/// One page of search results, with the totals the upstream declares.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchPage<I> {
    pub items: Vec<I>,
    pub total_pages: u32,
    pub total_found: u64,
}

/// Fetches one page (0-based) of a paginated search.
#[async_trait]
pub trait PageSearcher: Send + Sync + 'static {
    type Item: Send + 'static;

    async fn search_page(&self, query: &str, page: u32)
        -> Result<SearchPage<Self::Item>, FetchError>;
}
