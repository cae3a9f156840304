pub mod config;
pub mod logging;

pub mod breaker;
pub mod dispatch;
pub mod ledger;
pub mod pipeline;
pub mod retry;
pub mod search;
pub mod source;

pub use dispatch::{Dispatcher, Fetched};
pub use ledger::{FailureLedger, FailureRecord};
pub use pipeline::{FetchPipeline, FetchResult, RunStats};
pub use retry::{FetchError, RetryPolicy};
pub use search::{SearchDriver, SearchOutcome};
pub use source::{PageSearcher, RecordFetcher, SearchPage};
