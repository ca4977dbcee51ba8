//! Storage for Faultline error occurrences, groups and tracking settings.
//!
//! Backends implement [`ErrorStore`]. The in-memory backend is enabled by
//! default; the PostgreSQL backend sits behind the `postgres` feature.

mod config;
mod error;
mod provider;
mod settings;
mod traits;
mod types;

#[cfg(feature = "memory")]
mod memory;

#[cfg(feature = "postgres")]
mod postgres;

pub use config::StoreConfig;
pub use error::StoreError;
pub use provider::connect;
pub use settings::{InvalidSettings, TrackingSettings, DEFAULT_REDACTED_FIELDS};
pub use traits::ErrorStore;
pub use types::{
    CallerIdentity, ClientInfo, ErrorGroup, ErrorOccurrence, ErrorSource, GroupFilter, GroupSort,
    KeyClaim, OccurrenceFilter, Page, PerformanceMetrics, Resolution, StoreStats,
    DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT,
};

#[cfg(feature = "memory")]
pub use memory::MemoryStore;

#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;
