//! Error interception for axum services.
//!
//! [`ErrorInterceptorLayer`] wraps a router, converts handler failures and
//! panics into the uniform `{"error","statusCode","traceId"}` payload and
//! hands a captured [`ErrorOccurrence`](faultline_state::ErrorOccurrence) to
//! an optional [`ErrorReporter`] without delaying the response.

pub mod client;
pub mod error;
pub mod interceptor;
pub mod kind;
pub mod process;
pub mod reporter;

pub use client::{forwarded_ip, header_value, parse_user_agent, DeviceClass, UserAgentInfo};
pub use error::{ApiError, CapturedFailure, ErrorBody, INTERNAL_MESSAGE};
pub use interceptor::{
    ErrorInterceptor, ErrorInterceptorLayer, InterceptorConfig, TraceId, TRACE_ID_HEADER,
};
pub use kind::ErrorKind;
pub use reporter::{ErrorReporter, ReportError};
