//! Compiled regex chains used for ingress filtering.
//!
//! A `Filter` is a small, chainable wrapper over `regex::bytes::Regex` (the
//! original used a PCRE chain AND-ed together); multiple filters can be
//! composed with `Filter::and` to build a boolean AND chain, though current
//! configs only ever need one filter per group.

use regex::bytes::Regex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("invalid filter pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// A single compiled pattern, or an AND-chain of them.
pub struct Filter {
    links: Vec<Regex>,
}

impl Filter {
    /// Compile a single-pattern filter.
    pub fn new(pattern: &str) -> Result<Self, FilterError> {
        Ok(Filter {
            links: vec![Regex::new(pattern)?],
        })
    }

    /// Chain `next` onto this filter; the combined filter matches only when
    /// both match (AND semantics).
    pub fn and(mut self, next: Filter) -> Self {
        self.links.extend(next.links);
        self
    }

    /// True iff every link in the chain matches `input`.
    pub fn exec(&self, input: &[u8]) -> bool {
        self.links.iter().all(|re| re.is_match(input))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn single_pattern_matches() {
        let f = Filter::new(r"^hello\.").unwrap();
        assert!(f.exec(b"hello.world"));
        assert!(!f.exec(b"goodbye.world"));
    }

    #[test]
    fn chain_is_and() {
        let f = Filter::new(r"^hello\.").unwrap().and(Filter::new(r"\.world$").unwrap());
        assert!(f.exec(b"hello.world"));
        assert!(!f.exec(b"hello.there"));
        assert!(!f.exec(b"goodbye.world"));
    }

    #[test]
    fn invalid_pattern_errors() {
        assert!(Filter::new(r"(unclosed").is_err());
    }
}
