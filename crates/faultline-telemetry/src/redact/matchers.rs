//! Field-name matching for redaction.
//!
//! Names are compared case-insensitively with `-` and `_` treated alike, so
//! `api_key` covers an `Api-Key` header. Entries containing glob
//! metacharacters (`*`, `?`, `[`) are compiled as glob patterns.

use std::collections::HashSet;

use glob::{MatchOptions, Pattern};

const GLOB_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone, Default)]
pub struct FieldMatcher {
    names: HashSet<String>,
    globs: Vec<Pattern>,
}

impl FieldMatcher {
    pub fn compile<S: AsRef<str>>(fields: &[S]) -> Result<Self, MatcherError> {
        let mut matcher = Self::default();
        for field in fields {
            let field = canonical(field.as_ref().trim());
            if field.is_empty() {
                continue;
            }
            if field.contains(['*', '?', '[']) {
                matcher.globs.push(Pattern::new(&field)?);
            } else {
                matcher.names.insert(field);
            }
        }
        Ok(matcher)
    }

    pub fn matches(&self, name: &str) -> bool {
        let name = canonical(name);
        self.names.contains(&name) || self.globs.iter().any(|g| g.matches_with(&name, GLOB_OPTIONS))
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty() && self.globs.is_empty()
    }
}

fn canonical(name: &str) -> String {
    name.to_ascii_lowercase().replace('-', "_")
}

#[derive(Debug, thiserror::Error)]
pub enum MatcherError {
    #[error("invalid glob pattern: {0}")]
    InvalidGlob(#[from] glob::PatternError),
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("password", true)]
    #[case("PASSWORD", true)]
    #[case("Api-Key", true)]
    #[case("x_session_token", true)]
    #[case("X-Session-Token", true)]
    #[case("username", false)]
    #[case("tokens", false)]
    fn matches_names_and_globs(#[case] name: &str, #[case] expected: bool) {
        let matcher = FieldMatcher::compile(&["password", "api_key", "*_token"]).unwrap();
        assert_eq!(matcher.matches(name), expected);
    }

    #[test]
    fn blank_entries_are_ignored() {
        let matcher = FieldMatcher::compile(&["", "  "]).unwrap();
        assert!(matcher.is_empty());
        assert!(!matcher.matches(""));
    }

    #[test]
    fn invalid_glob_is_rejected() {
        assert!(FieldMatcher::compile(&["secret[", "password"]).is_err());
    }
}
