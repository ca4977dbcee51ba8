//! Faultline telemetry service.
//!
//! Receives occurrences captured by the gateway interceptor (and batches from
//! browser clients), groups them under stable signatures, persists them
//! through an [`ErrorStore`](faultline_state::ErrorStore) and fans out live
//! events to dashboards.
//!
//! ## Architecture
//!
//! ```text
//! ErrorInterceptor → ErrorRecorder → ErrorStore
//!                         ↓
//!                    Broadcaster → WebSocket subscribers
//! ```

pub mod api;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod errors;
pub mod recorder;
pub mod redact;
pub mod retention;
pub mod service;
pub mod settings;

pub use config::FaultlineConfig;
pub use error::TelemetryError;
pub use recorder::{ErrorRecorder, RecordOutcome};
pub use service::Service;
