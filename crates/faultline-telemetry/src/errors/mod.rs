//! Error classification and grouping.
//!
//! - [`normalise`]: error type, stack frame and route normalisation
//! - [`signature`]: SHA-256 group signatures
//! - [`grouping`]: find-or-create of groups against the store

pub mod grouping;
pub mod normalise;
pub mod signature;

pub use grouping::{GroupResolver, ResolvedGroup, DEFAULT_MAX_GROUP_ATTEMPTS};
pub use normalise::{
    normalise_error_type, normalise_frame, normalise_route, truncate_message, ID_PLACEHOLDER,
};
pub use signature::{
    compute_signature, first_application_frame, should_group_errors, Classifier,
    DEFAULT_FRAMEWORK_PREFIXES,
};

/// Default maximum stored message length, in characters.
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 1000;
