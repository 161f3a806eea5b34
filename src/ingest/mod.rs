pub mod cache;
pub mod engine;
pub mod fetcher;
pub mod governor;
pub mod prizepicks;

pub use cache::ResponseCache;
pub use engine::{IngestionEngine, IngestionStatus, IngestionStatusHandle};
pub use fetcher::{FetchOutcome, HttpFetcher, UpstreamClient};
pub use governor::RateGovernor;
