// SPDX-License-Identifier: MIT
//! POSIX-style environment variable expansion for skill frontmatter.
//!
//! Recognized forms:
//!   `${VAR}`              — value, or empty string when undefined
//!   `${VAR:-default}`     — default when VAR is undefined or empty
//!   `${VAR:+replacement}` — replacement when VAR is defined and non-empty
//!
//! Applied to the raw frontmatter bytes before YAML parsing; the markdown
//! body is never expanded.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static ENV_VAR_RE: Lazy<Regex> = Lazy::new(|| {
    // Name: letter or underscore, then letters/digits/underscores.
    // Operand: anything up to the closing brace.
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::([+-])([^}]*))?\}").expect("env var regex")
});

/// Expand against the process environment.
pub fn expand_env(input: &str) -> String {
    expand_with(input, |name| std::env::var(name).ok())
}

/// Expand with an injectable lookup (tests pass a closure).
pub fn expand_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    ENV_VAR_RE
        .replace_all(input, |caps: &Captures| {
            let value = lookup(&caps[1]);
            let set_and_non_empty = value.as_deref().is_some_and(|v| !v.is_empty());

            match caps.get(2).map(|m| m.as_str()) {
                None => value.unwrap_or_default(),
                Some("-") => {
                    if set_and_non_empty {
                        value.unwrap_or_default()
                    } else {
                        caps[3].to_string()
                    }
                }
                Some("+") => {
                    if set_and_non_empty {
                        caps[3].to_string()
                    } else {
                        String::new()
                    }
                }
                // Unreachable given the regex, but keep the raw token.
                Some(_) => caps[0].to_string(),
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| {
            pairs
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn simple_expansion() {
        let vars = [("HOST", "10.0.0.1")];
        assert_eq!(expand_with("addr: ${HOST}", env(&vars)), "addr: 10.0.0.1");
    }

    #[test]
    fn undefined_expands_to_empty() {
        assert_eq!(expand_with("addr: ${MISSING}", env(&[])), "addr: ");
    }

    #[test]
    fn default_when_undefined_or_empty() {
        assert_eq!(
            expand_with("${PORT:-8080}", env(&[])),
            "8080",
        );
        let empty = [("PORT", "")];
        assert_eq!(expand_with("${PORT:-8080}", env(&empty)), "8080");
        let set = [("PORT", "9000")];
        assert_eq!(expand_with("${PORT:-8080}", env(&set)), "9000");
    }

    #[test]
    fn replacement_when_set_and_non_empty() {
        let set = [("DEBUG", "1")];
        assert_eq!(expand_with("${DEBUG:+--verbose}", env(&set)), "--verbose");
        let empty = [("DEBUG", "")];
        assert_eq!(expand_with("${DEBUG:+--verbose}", env(&empty)), "");
        assert_eq!(expand_with("${DEBUG:+--verbose}", env(&[])), "");
    }

    #[test]
    fn multiple_tokens_in_one_line() {
        let vars = [("A", "1"), ("B", "2")];
        assert_eq!(expand_with("${A}-${B}-${C:-3}", env(&vars)), "1-2-3");
    }

    #[test]
    fn non_matching_text_is_untouched() {
        assert_eq!(expand_with("plain $VAR ${0bad} text", env(&[])), "plain $VAR ${0bad} text");
    }
}
