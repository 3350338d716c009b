//
// Copyright 2025 The Sigstore Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use regex::Regex;

use crate::errors::{ImageGuardError, Result};

/// Compile a pattern where `*` matches any sequence of characters and `?`
/// matches a single character. The whole text must match.
pub(crate) fn compile(pattern: &str) -> Result<Regex> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    let mut literal = [0u8; 4];
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            c => expr.push_str(&regex::escape(c.encode_utf8(&mut literal))),
        }
    }
    expr.push('$');

    Regex::new(&expr).map_err(|e| ImageGuardError::InvalidImagePattern {
        pattern: pattern.to_string(),
        error: e.to_string(),
    })
}

/// A pattern compiled once and matched many times.
#[derive(Debug, Clone)]
pub(crate) enum Pattern {
    Exact(String),
    Wildcard(Regex),
}

impl Pattern {
    pub(crate) fn new(pattern: &str) -> Result<Self> {
        if pattern.contains(['*', '?']) {
            Ok(Pattern::Wildcard(compile(pattern)?))
        } else {
            Ok(Pattern::Exact(pattern.to_string()))
        }
    }

    pub(crate) fn is_match(&self, text: &str) -> bool {
        match self {
            Pattern::Exact(pattern) => pattern == text,
            Pattern::Wildcard(regex) => regex.is_match(text),
        }
    }
}

/// `true` when `text` matches `pattern`.
pub(crate) fn matches(pattern: &str, text: &str) -> Result<bool> {
    Ok(Pattern::new(pattern)?.is_match(text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("*", "ghcr.io/kyverno/test-verify-image:signed", true)]
    #[case("ghcr.io/*", "ghcr.io/kyverno/test-verify-image:signed", true)]
    #[case("ghcr.io/*", "docker.io/library/nginx", false)]
    #[case("ghcr.io/kyverno/test-verify-image:*", "ghcr.io/kyverno/test-verify-image:signed", true)]
    #[case("ghcr.io/kyverno/test-verify-image:v?", "ghcr.io/kyverno/test-verify-image:v1", true)]
    #[case("ghcr.io/kyverno/test-verify-image:v?", "ghcr.io/kyverno/test-verify-image:v10", false)]
    #[case("nginx", "nginx", true)]
    #[case("nginx", "nginx:latest", false)]
    #[case("a.b*", "axb", false)]
    fn wildcard(#[case] pattern: &str, #[case] text: &str, #[case] expected: bool) {
        assert_eq!(matches(pattern, text).unwrap(), expected);
    }

    #[test]
    fn compiled_pattern_is_reused() {
        let pattern = Pattern::new("ghcr.io/kyverno/*").unwrap();
        assert!(matches!(pattern, Pattern::Wildcard(_)));
        assert!(pattern.is_match("ghcr.io/kyverno/a:1"));
        assert!(pattern.is_match("ghcr.io/kyverno/b:2"));
        assert!(!pattern.is_match("docker.io/library/nginx"));

        assert!(matches!(Pattern::new("nginx").unwrap(), Pattern::Exact(_)));
    }
}
