//! Utility functions for the proxy pool.

use std::time::{SystemTime, UNIX_EPOCH};

use url::Url;

/// Derive the rotation-queue domain key from a destination URL or bare host.
pub(crate) fn parse_domain(destination: &str) -> String {
    let with_scheme = if destination.contains("://") {
        destination.to_string()
    } else {
        format!("http://{destination}")
    };

    match Url::parse(&with_scheme) {
        Ok(url) => url
            .host_str()
            .map(str::to_ascii_lowercase)
            .unwrap_or_else(|| destination.to_ascii_lowercase()),
        Err(_) => destination.to_ascii_lowercase(),
    }
}

/// Current time as unix seconds.
pub(crate) fn now_ts() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_domain_from_url() {
        assert_eq!(parse_domain("https://Example.com/path?q=1"), "example.com");
        assert_eq!(parse_domain("http://sub.example.com:8080/"), "sub.example.com");
    }

    #[test]
    fn parses_bare_host() {
        assert_eq!(parse_domain("example.com"), "example.com");
        assert_eq!(parse_domain("example.com/path"), "example.com");
    }

    #[test]
    fn now_is_sane() {
        // Well after 2020-01-01.
        assert!(now_ts() > 1_577_836_800);
    }
}
