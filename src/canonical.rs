//! URL canonicalization.
//!
//! Two feed entries are the same article when their URLs normalize to the
//! same string. Normalization strips the fragment, lowercases the host,
//! drops tracking query parameters and collapses a non-root trailing slash.

use sha2::{Digest, Sha256};
use url::Url;

const TRACKING_PARAMS: &[&str] = &["ref", "fbclid", "gclid"];
const TRACKING_PREFIXES: &[&str] = &["utm_"];

fn is_tracking_param(key: &str) -> bool {
    let lowered = key.to_ascii_lowercase();
    TRACKING_PARAMS.contains(&lowered.as_str())
        || TRACKING_PREFIXES
            .iter()
            .any(|prefix| lowered.starts_with(prefix))
}

/// Normalize a URL for deduplication.
///
/// Strings that do not parse as absolute URLs only lose their fragment.
pub fn normalize(raw: &str) -> String {
    let raw = raw.trim();
    let mut url = match Url::parse(raw) {
        Ok(url) => url,
        Err(_) => return strip_fragment(raw).to_string(),
    };

    url.set_fragment(None);

    if let Some(host) = url.host_str() {
        let lowered = host.to_lowercase();
        if lowered != host {
            // Only fails for hosts that cannot be set at all, which parse rejects
            let _ = url.set_host(Some(&lowered));
        }
    }

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !is_tracking_param(key))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept.iter());
    }

    let path = url.path();
    if path.len() > 1 && path.ends_with('/') {
        let trimmed = path.trim_end_matches('/');
        let trimmed = if trimmed.is_empty() { "/" } else { trimmed }.to_string();
        url.set_path(&trimmed);
    }

    url.to_string()
}

fn strip_fragment(raw: &str) -> &str {
    raw.split_once('#').map(|(head, _)| head).unwrap_or(raw)
}

/// SHA-256 of the normalized URL, hex encoded.
pub fn canonical_hash(raw: &str) -> String {
    sha256_hex(&normalize(raw))
}

pub fn sha256_hex(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    mod normalize_tests {
        use super::*;

        #[test]
        fn test_strips_fragment_and_tracking_params() {
            let url = "https://Example.COM/News/Story/?utm_source=feed&ref=homepage&ok=1#section";
            assert_eq!(normalize(url), "https://example.com/News/Story?ok=1");
        }

        #[test]
        fn test_keeps_root_slash() {
            assert_eq!(normalize("https://example.com"), "https://example.com/");
            assert_eq!(normalize("https://example.com/"), "https://example.com/");
        }

        #[test]
        fn test_trims_trailing_slash_for_non_root() {
            assert_eq!(
                normalize("https://example.com/path/subpath/"),
                "https://example.com/path/subpath"
            );
        }

        #[test]
        fn test_collapses_repeated_trailing_slashes() {
            assert_eq!(normalize("https://example.com/a//"), "https://example.com/a");
        }

        #[test]
        fn test_preserves_non_tracking_params_in_order() {
            assert_eq!(
                normalize("https://example.com/a?b=2&utm_medium=feed&c=3"),
                "https://example.com/a?b=2&c=3"
            );
            assert_eq!(
                normalize("https://example.com/a?z=1&fbclid=x&a=2&gclid=y"),
                "https://example.com/a?z=1&a=2"
            );
        }

        #[test]
        fn test_tracking_params_are_case_insensitive() {
            assert_eq!(
                normalize("https://example.com/a?UTM_Source=x&Ref=y"),
                "https://example.com/a"
            );
        }

        #[test]
        fn test_keeps_path_and_query_case() {
            assert_eq!(
                normalize("https://EXAMPLE.com/CamelCase?Key=Value"),
                "https://example.com/CamelCase?Key=Value"
            );
        }

        #[test]
        fn test_keeps_explicit_port() {
            assert_eq!(
                normalize("http://Example.com:8080/feed/"),
                "http://example.com:8080/feed"
            );
        }

        #[test]
        fn test_unparseable_url_only_loses_fragment() {
            assert_eq!(normalize("not a url#frag"), "not a url");
        }

        #[test]
        fn test_is_idempotent() {
            let urls = [
                "https://Example.COM/News/Story/?utm_source=feed&ref=homepage&ok=1#section",
                "https://example.com",
                "https://example.com/path/subpath/",
                "https://example.com/search?q=hello%20world&utm_campaign=x",
                "https://example.com/a?flag",
                "relative/path#x",
            ];
            for url in urls {
                let once = normalize(url);
                assert_eq!(normalize(&once), once, "not idempotent for {}", url);
            }
        }
    }

    mod hash_tests {
        use super::*;

        #[test]
        fn test_hash_is_sha256_of_normalized_url() {
            let expected = sha256_hex("https://example.com/a");
            assert_eq!(canonical_hash("https://Example.com/a/#fragment"), expected);
        }

        #[test]
        fn test_known_digest() {
            assert_eq!(
                sha256_hex("abc"),
                "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
            );
        }

        #[test]
        fn test_tracking_and_slash_variants_hash_identically() {
            let a = canonical_hash("https://example.com/post/?utm_source=rss");
            let b = canonical_hash("https://example.com/post");
            assert_eq!(a, b);
            assert_eq!(a.len(), 64);
        }

        #[test]
        fn test_different_articles_hash_differently() {
            assert_ne!(
                canonical_hash("https://example.com/post-1"),
                canonical_hash("https://example.com/post-2")
            );
        }
    }
}
