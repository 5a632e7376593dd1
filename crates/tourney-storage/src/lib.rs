//! Page fetching, raw page archive and the entity store for tournament ingestion.

pub mod artifacts;
pub mod fetch;
pub mod memory;
pub mod postgres;
pub mod store;

pub use artifacts::{ArchivedPage, ArtifactStore};
pub use fetch::{
    FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, PageFetcher, ProbeResponse,
    RateLimiter,
};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use store::{AggregateBuilder, AggregateRebuild, StoreError, TournamentStore};

pub const CRATE_NAME: &str = "tourney-storage";
