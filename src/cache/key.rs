//! Cache key normalization and invalidation patterns

use regex_lite::Regex;
use sha2::{Digest, Sha256};

use crate::error::CacheError;

/// Build a cache key from a request signature
///
/// `path?sorted-query`, with `#<sha256>` of the body appended for methods
/// other than GET.
pub fn cache_key(method: &str, path: &str, query: &[(String, String)], body: Option<&[u8]>) -> String {
    let mut key = normalize_path(path);

    if !query.is_empty() {
        let mut pairs: Vec<&(String, String)> = query.iter().collect();
        pairs.sort();
        let joined: Vec<String> = pairs.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        key.push('?');
        key.push_str(&joined.join("&"));
    }

    if !method.eq_ignore_ascii_case("GET") {
        if let Some(body) = body {
            key.push('#');
            key.push_str(&hex::encode(Sha256::digest(body)));
        }
    }

    key
}

/// Leading slash, no trailing slash, no empty segments
fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}

/// Compile a glob (`*` any run, `?` one char) into an anchored regex
pub fn glob_to_regex(pattern: &str) -> Result<Regex, CacheError> {
    let mut source = String::with_capacity(pattern.len() + 8);
    source.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => source.push_str(".*"),
            '?' => source.push('.'),
            c if "\\.+()|[]{}^$".contains(c) => {
                source.push('\\');
                source.push(c);
            }
            c => source.push(c),
        }
    }
    source.push('$');
    Regex::new(&source).map_err(|e| CacheError::InvalidPattern(format!("{}: {}", pattern, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    // Test 1: Query order does not change the key
    #[test]
    fn test_key_sorts_query() {
        let a = cache_key("GET", "/campaigns", &q(&[("b", "2"), ("a", "1")]), None);
        let b = cache_key("GET", "/campaigns", &q(&[("a", "1"), ("b", "2")]), None);
        assert_eq!(a, b);
        assert_eq!(a, "/campaigns?a=1&b=2");
    }

    // Test 2: Paths are normalized
    #[test]
    fn test_key_normalizes_path() {
        assert_eq!(cache_key("GET", "campaigns/", &[], None), "/campaigns");
        assert_eq!(cache_key("GET", "//flows//1", &[], None), "/flows/1");
    }

    // Test 3: Body hash only for non-GET
    #[test]
    fn test_key_body_hash() {
        let get = cache_key("GET", "/report", &[], Some(b"{}"));
        assert_eq!(get, "/report");

        let post = cache_key("POST", "/report", &[], Some(b"{}"));
        let other = cache_key("POST", "/report", &[], Some(b"{\"a\":1}"));
        assert!(post.starts_with("/report#"));
        assert_eq!(post.len(), "/report#".len() + 64);
        assert_ne!(post, other);
    }

    // Test 4: Glob patterns
    #[test]
    fn test_glob_to_regex() {
        let re = glob_to_regex("/campaigns*").unwrap();
        assert!(re.is_match("/campaigns"));
        assert!(re.is_match("/campaigns?start=2025-01-01"));
        assert!(!re.is_match("/flows"));
        assert!(!re.is_match("x/campaigns"));

        let re = glob_to_regex("/flows/?").unwrap();
        assert!(re.is_match("/flows/1"));
        assert!(!re.is_match("/flows/12"));

        let re = glob_to_regex("/a.b[1]").unwrap();
        assert!(re.is_match("/a.b[1]"));
        assert!(!re.is_match("/aXb1"));
    }
}
