//! URL intake for the `add` command: pasted text in, queueable URLs out.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use url::Url;

fn url_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"https?://\S+").ok()).as_ref()
}

/// Every http(s) URL found in `text`, normalized and de-duplicated in order
/// of first appearance. Anything `url` cannot parse is skipped.
pub fn extract_urls(text: &str) -> Vec<String> {
    let Some(re) = url_regex() else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    re.find_iter(text)
        .filter_map(|m| normalize_http_url(trim_trailing_punct(m.as_str())))
        .filter(|u| seen.insert(u.clone()))
        .collect()
}

/// Parse an http(s) URL, dropping the fragment and any default port.
/// `url` already lowercases scheme and host.
pub fn normalize_http_url(input: &str) -> Option<String> {
    let mut url = Url::parse(input.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return None;
    }
    url.set_fragment(None);
    Some(url.to_string())
}

/// Short site label stored as `website` until metadata says otherwise.
pub fn site_name(input: &str) -> Option<String> {
    let url = Url::parse(input).ok()?;
    let host = url.host_str()?;
    let host = host.strip_prefix("www.").unwrap_or(host);
    let host = host.strip_prefix("m.").unwrap_or(host);
    Some(host.to_string())
}

/// Peel punctuation that prose and markdown put right after a URL.
fn trim_trailing_punct(s: &str) -> &str {
    s.trim_end_matches(|c: char| {
        matches!(
            c,
            ')' | ']' | '}' | '>' | ',' | '.' | ';' | ':' | '!' | '?' | '"' | '\''
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_urls_in_pasted_text() {
        let urls = extract_urls(
            "queue these: https://example.com/x\nand (https://example.com/y), again https://example.com/x",
        );
        assert_eq!(urls, vec!["https://example.com/x", "https://example.com/y"]);
    }

    #[test]
    fn normalizes_host_port_and_fragment() {
        assert_eq!(
            normalize_http_url("HTTPS://Example.COM:443/watch?v=1#t=10").as_deref(),
            Some("https://example.com/watch?v=1")
        );
        assert_eq!(
            normalize_http_url("http://example.com:8080/a").as_deref(),
            Some("http://example.com:8080/a")
        );
    }

    #[test]
    fn rejects_other_schemes() {
        assert_eq!(normalize_http_url("ftp://example.com/x"), None);
        assert_eq!(normalize_http_url("not a url"), None);
        assert!(extract_urls("ftp://example.com/x").is_empty());
        assert!(extract_urls("   ").is_empty());
    }

    #[test]
    fn site_name_drops_common_prefixes() {
        assert_eq!(
            site_name("https://www.youtube.com/watch?v=1").as_deref(),
            Some("youtube.com")
        );
        assert_eq!(
            site_name("https://m.example.org/a").as_deref(),
            Some("example.org")
        );
        assert_eq!(site_name("nope"), None);
    }
}
