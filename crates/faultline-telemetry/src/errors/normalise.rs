//! Normalisation of the inputs to a group signature.
//!
//! Strips the parts of error types, stack frames and routes that vary between
//! otherwise identical failures: generic arguments, line numbers, memory
//! addresses, symbol hashes and id-like path segments.

use std::sync::LazyLock;

use regex::Regex;

/// Placeholder substituted for id-like route segments.
pub const ID_PLACEHOLDER: &str = "{id}";

struct NormalisationPatterns {
    /// `file.rs:123` or `file.rs:123:45`, followed by a delimiter or the end.
    line_numbers: Regex,
    /// `0x7fff5fbfe000`
    memory_addresses: Regex,
    /// Symbol hash suffix in Rust backtraces: `::h1a2b3c4d5e6f7a8b`.
    symbol_hashes: Regex,
    /// Leading frame index: `  12: `.
    frame_index: Regex,
    uuid: Regex,
}

fn build_patterns() -> Option<NormalisationPatterns> {
    Some(NormalisationPatterns {
        line_numbers: Regex::new(r":(\d+)(:\d+)?([\s\)\]>]|$)").ok()?,
        memory_addresses: Regex::new(r"0x[0-9a-fA-F]{4,16}").ok()?,
        symbol_hashes: Regex::new(r"::h[0-9a-f]{16}\b").ok()?,
        frame_index: Regex::new(r"^\d+:\s+").ok()?,
        uuid: Regex::new(
            r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$",
        )
        .ok()?,
    })
}

#[allow(clippy::incompatible_msrv)]
static PATTERNS: LazyLock<Option<NormalisationPatterns>> = LazyLock::new(build_patterns);

/// Trim, drop a leading `dyn ` and strip generic arguments.
///
/// `dyn std::error::Error + Send` is reduced to `std::error::Error`.
#[must_use]
pub fn normalise_error_type(error_type: &str) -> String {
    let trimmed = error_type.trim();
    let trimmed = trimmed.strip_prefix("dyn ").unwrap_or(trimmed);
    let base = trimmed.split('<').next().unwrap_or(trimmed);
    let base = base.split(" + ").next().unwrap_or(base);
    base.trim().to_owned()
}

/// Strip frame index, line and column numbers, addresses and symbol hashes
/// from a single stack line.
///
/// Without line numbers a group survives redeploys that shift code, but two
/// raise sites of the same error type in one file, on the same route, share
/// a group.
#[must_use]
pub fn normalise_frame(frame: &str) -> String {
    let frame = frame.trim();
    let Some(patterns) = PATTERNS.as_ref() else {
        return frame.to_owned();
    };

    let result = patterns.frame_index.replace(frame, "");
    let result = patterns.line_numbers.replace_all(&result, "$3");
    let result = patterns.memory_addresses.replace_all(&result, "0xADDR");
    let result = patterns.symbol_hashes.replace_all(&result, "");
    result.trim().to_owned()
}

/// Reduce a request path to a route template.
///
/// Query string and fragment are removed, a scheme and host are stripped,
/// duplicate and trailing slashes collapse, and numeric, UUID and long
/// hex or opaque segments become `{id}`. Existing template segments such as
/// `{id}` or `:id` are kept.
#[must_use]
pub fn normalise_route(route: &str) -> String {
    let route = route.trim();
    let route = route.split(['?', '#']).next().unwrap_or(route);
    let path = match route.split_once("://") {
        Some((_, rest)) => rest.find('/').map_or("/", |idx| &rest[idx..]),
        None => route,
    };

    let segments: Vec<String> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|segment| {
            if is_template(segment) {
                segment.to_owned()
            } else if is_id_segment(segment) {
                ID_PLACEHOLDER.to_owned()
            } else {
                segment.to_lowercase()
            }
        })
        .collect();

    if segments.is_empty() {
        "/".to_owned()
    } else {
        format!("/{}", segments.join("/"))
    }
}

fn is_template(segment: &str) -> bool {
    (segment.starts_with('{') && segment.ends_with('}')) || segment.starts_with(':')
}

fn is_id_segment(segment: &str) -> bool {
    if segment.bytes().all(|b| b.is_ascii_digit()) {
        return true;
    }
    if PATTERNS
        .as_ref()
        .is_some_and(|p| p.uuid.is_match(segment))
    {
        return true;
    }
    let has_digit = segment.bytes().any(|b| b.is_ascii_digit());
    if segment.len() >= 16 && has_digit && segment.bytes().all(|b| b.is_ascii_hexdigit()) {
        return true;
    }
    // Opaque tokens: long, mixed letters and digits, no word separators.
    segment.len() >= 20
        && has_digit
        && segment.bytes().any(|b| b.is_ascii_alphabetic())
        && segment.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Truncate to at most `max_chars` characters, ending in `...` when cut.
///
/// Operates on characters, never splitting a UTF-8 sequence.
#[must_use]
pub fn truncate_message(message: &str, max_chars: usize) -> String {
    const MARKER: &str = "...";

    if message.chars().count() <= max_chars {
        return message.to_owned();
    }
    if max_chars < MARKER.len() {
        return MARKER[..max_chars].to_owned();
    }
    let mut truncated: String = message.chars().take(max_chars - MARKER.len()).collect();
    truncated.push_str(MARKER);
    truncated
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("NotFound", "NotFound")]
    #[case("  std::io::error::Error ", "std::io::error::Error")]
    #[case("dyn std::error::Error + Send + Sync", "std::error::Error")]
    #[case("core::result::Result<u8, String>", "core::result::Result")]
    #[case("Vec<Option<i32>>", "Vec")]
    fn error_types(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(normalise_error_type(input), expected);
    }

    #[rstest]
    #[case("at src/handlers.rs:42:10", "at src/handlers.rs")]
    #[case("  3: my_app::handlers::get_widget::h0123456789abcdef", "my_app::handlers::get_widget")]
    #[case("at 0x7fff5fbfe000 in main", "at 0xADDR in main")]
    #[case(
        "at fetchWidgets (https://app.example.com/static/main.js:1:2345)",
        "at fetchWidgets (https://app.example.com/static/main.js)"
    )]
    fn frames(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(normalise_frame(input), expected);
    }

    #[rstest]
    #[case("/api/widgets/42", "/api/widgets/{id}")]
    #[case("/api/widgets/{id}", "/api/widgets/{id}")]
    #[case("/api/widgets/:id/parts", "/api/widgets/:id/parts")]
    #[case("/api//Widgets/42/", "/api/widgets/{id}")]
    #[case("/api/widgets/42?expand=parts#top", "/api/widgets/{id}")]
    #[case(
        "/api/users/550e8400-e29b-41d4-a716-446655440000/sessions",
        "/api/users/{id}/sessions"
    )]
    #[case("/api/commits/9fceb02d0ae598e95dc970b74767f19372d61af8", "/api/commits/{id}")]
    #[case("/api/invites/AbC123xYz789QwE456rTy0", "/api/invites/{id}")]
    #[case("/api/feature-flags/enable-dark-mode", "/api/feature-flags/enable-dark-mode")]
    #[case("/docs/release-notes-2024-configuration", "/docs/release-notes-2024-configuration")]
    #[case("https://app.example.com/orders/77?x=1", "/orders/{id}")]
    #[case("https://app.example.com", "/")]
    #[case("", "/")]
    #[case("/", "/")]
    fn routes(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(normalise_route(input), expected);
    }

    #[test]
    fn truncate_keeps_short_messages() {
        assert_eq!(truncate_message("Widget 42 not found", 1000), "Widget 42 not found");
        let exact = "a".repeat(1000);
        assert_eq!(truncate_message(&exact, 1000), exact);
    }

    #[test]
    fn truncate_long_messages_to_exact_length() {
        let long = "x".repeat(5000);
        let truncated = truncate_message(&long, 1000);
        assert_eq!(truncated.chars().count(), 1000);
        assert!(truncated.ends_with("..."));
        assert!(truncated.starts_with(&"x".repeat(997)));
    }

    #[test]
    fn truncate_counts_characters_not_bytes() {
        let long = "é".repeat(20);
        let truncated = truncate_message(&long, 10);
        assert_eq!(truncated.chars().count(), 10);
        assert_eq!(truncated, format!("{}...", "é".repeat(7)));
    }

    #[test]
    fn truncate_tiny_limits() {
        assert_eq!(truncate_message("abcdef", 2), "..");
        assert_eq!(truncate_message("abcdef", 0), "");
    }
}
