//! Group signatures.
//!
//! A signature is the hex SHA-256 of the normalised error type, the first
//! application stack frame and the normalised route, `\0`-delimited. Two
//! occurrences belong to the same group iff their signatures are equal.

use sha2::{Digest, Sha256};

use super::normalise::{normalise_error_type, normalise_frame, normalise_route};

/// Frame prefixes treated as framework code out of the box.
///
/// Entries ending in `::` match module paths at the start of a frame; all
/// others match anywhere in the frame (file paths, bundle locations).
pub const DEFAULT_FRAMEWORK_PREFIXES: &[&str] = &[
    "std::",
    "core::",
    "alloc::",
    "tokio::",
    "tokio_util::",
    "axum::",
    "axum_core::",
    "tower::",
    "tower_http::",
    "hyper::",
    "hyper_util::",
    "futures::",
    "futures_util::",
    "futures_core::",
    "faultline_gateway::",
    "/faultline-gateway/src/",
    "rust_begin_unwind",
    "__rust",
    "/rustc/",
    "/.cargo/registry/",
    "node_modules",
    "webpack",
    "<anonymous>",
];

/// Computes group signatures with a configurable framework-frame filter.
#[derive(Debug, Clone)]
pub struct Classifier {
    module_prefixes: Vec<String>,
    path_markers: Vec<String>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(DEFAULT_FRAMEWORK_PREFIXES)
    }
}

impl Classifier {
    pub fn new<S: AsRef<str>>(framework_prefixes: &[S]) -> Self {
        let (module_prefixes, path_markers) = framework_prefixes
            .iter()
            .map(|p| p.as_ref().to_owned())
            .filter(|p| !p.is_empty())
            .partition(|p| p.ends_with("::"));
        Self {
            module_prefixes,
            path_markers,
        }
    }

    #[must_use]
    pub fn signature(&self, error_type: &str, stack_trace: Option<&str>, route: &str) -> String {
        const DELIMITER: &[u8] = b"\x00";

        let frame = stack_trace
            .map(|trace| self.first_application_frame(trace))
            .unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(normalise_error_type(error_type).as_bytes());
        hasher.update(DELIMITER);
        hasher.update(frame.as_bytes());
        hasher.update(DELIMITER);
        hasher.update(normalise_route(route).as_bytes());

        hex::encode(hasher.finalize())
    }

    /// First non-empty, non-framework line of `stack_trace`, normalised.
    /// Empty when every frame is framework code.
    #[must_use]
    pub fn first_application_frame(&self, stack_trace: &str) -> String {
        stack_trace
            .lines()
            .map(normalise_frame)
            .find(|frame| !frame.is_empty() && !self.is_framework_frame(frame))
            .unwrap_or_default()
    }

    fn is_framework_frame(&self, frame: &str) -> bool {
        let symbol = frame.strip_prefix("at ").unwrap_or(frame).trim_start();
        let symbol = symbol.strip_prefix('<').unwrap_or(symbol);
        self.module_prefixes.iter().any(|p| symbol.starts_with(p.as_str()))
            || self.path_markers.iter().any(|m| frame.contains(m.as_str()))
    }
}

/// Signature with the default framework prefixes.
#[must_use]
pub fn compute_signature(error_type: &str, stack_trace: Option<&str>, route: &str) -> String {
    Classifier::default().signature(error_type, stack_trace, route)
}

/// First application frame with the default framework prefixes.
#[must_use]
pub fn first_application_frame(stack_trace: &str) -> String {
    Classifier::default().first_application_frame(stack_trace)
}

/// Exact signature equality.
#[must_use]
pub fn should_group_errors(a: &str, b: &str) -> bool {
    a == b
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUST_TRACE: &str = "\
   0: std::backtrace_rs::backtrace::libunwind::trace
             at /rustc/82e1608dfa6e0b5569232559e3d385fea5a93112/library/std/src/../../backtrace/src/backtrace/libunwind.rs:93:5
   1: faultline_gateway::error::ApiError::new
             at ./crates/faultline-gateway/src/error.rs:77:24
   2: widgets::handlers::get_widget::h0123456789abcdef
             at ./src/handlers.rs:42:10
   3: axum::handler::Handler::call
             at /home/dev/.cargo/registry/src/index.crates.io-6f17d22bba15001f/axum-0.8.1/src/handler/mod.rs:210:5";

    #[test]
    fn signature_is_64_hex_chars() {
        let sig = compute_signature("NotFound", Some("at src/widgets.rs:10:5"), "/api/widgets/{id}");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn identical_triples_share_a_signature() {
        let a = compute_signature("NotFound", Some("at src/widgets.rs:10:5"), "/api/widgets/42");
        let b = compute_signature("NotFound", Some("at src/widgets.rs:10:5"), "/api/widgets/42");
        assert!(should_group_errors(&a, &b));
    }

    #[test]
    fn any_component_changes_the_signature() {
        let base = compute_signature("NotFound", Some("at src/widgets.rs:10:5"), "/api/widgets");
        let other_type =
            compute_signature("Conflict", Some("at src/widgets.rs:10:5"), "/api/widgets");
        let other_frame =
            compute_signature("NotFound", Some("at src/gadgets.rs:10:5"), "/api/widgets");
        let other_route =
            compute_signature("NotFound", Some("at src/widgets.rs:10:5"), "/api/gadgets");

        assert!(!should_group_errors(&base, &other_type));
        assert!(!should_group_errors(&base, &other_frame));
        assert!(!should_group_errors(&base, &other_route));
    }

    #[test]
    fn redeploys_and_ids_do_not_split_groups() {
        let before = compute_signature(
            "NotFound",
            Some("at src/widgets.rs:10:5"),
            "/api/widgets/42?verbose=1",
        );
        let after = compute_signature("NotFound", Some("at src/widgets.rs:57:9"), "/api/widgets/7");
        assert_eq!(before, after);
    }

    #[test]
    fn generic_arguments_do_not_split_groups() {
        let a = compute_signature("Result<u8, Error>", None, "/x");
        let b = compute_signature("Result<String, Error>", None, "/x");
        assert_eq!(a, b);
    }

    #[test]
    fn fields_are_delimited() {
        // Without a delimiter "ab" + "" and "a" + "b" would collide.
        let a = compute_signature("ab", None, "/");
        let b = compute_signature("a", Some("b"), "/");
        assert_ne!(a, b);
    }

    #[test]
    fn skips_framework_frames() {
        assert_eq!(
            first_application_frame(RUST_TRACE),
            "widgets::handlers::get_widget"
        );

        let classifier = Classifier::new(&["std::", "/rustc/"]);
        assert_eq!(
            classifier.first_application_frame(RUST_TRACE),
            "faultline_gateway::error::ApiError::new"
        );
    }

    #[test]
    fn javascript_frames() {
        let trace = "TypeError: Cannot read properties of undefined\n\
            at Object.render (webpack-internal:///./node_modules/react-dom/cjs/react-dom.js:10:3)\n\
            at WidgetList (https://app.example.com/static/js/widgets.js:120:17)";
        assert_eq!(
            first_application_frame(trace),
            "TypeError: Cannot read properties of undefined"
        );
        assert_eq!(
            first_application_frame(&trace.lines().skip(1).collect::<Vec<_>>().join("\n")),
            "at WidgetList (https://app.example.com/static/js/widgets.js)"
        );
    }

    #[test]
    fn all_framework_frames_yield_empty() {
        assert_eq!(first_application_frame("   0: std::panicking::begin_panic\n\n"), "");
        assert_eq!(first_application_frame(""), "");
    }
}
