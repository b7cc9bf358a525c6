//! Header helpers shared by the forwarding and tunnelling paths. Message
//! framing itself is left to hyper.

use http::HeaderMap;
use std::time::Duration;

/// Comma-separated elements of every `name` header, trimmed.
pub fn tokens<'a>(headers: &'a HeaderMap, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Whether any element of `name` equals `token`, ignoring case.
pub fn has_token(headers: &HeaderMap, name: &str, token: &str) -> bool {
    tokens(headers, name).any(|t| t.eq_ignore_ascii_case(token))
}

/// `Transfer-Encoding` value with the `chunked` coding removed, or `None`
/// when nothing else remains.
pub fn strip_chunked(value: &str) -> Option<String> {
    let rest: Vec<&str> = value
        .split(',')
        .map(str::trim)
        .filter(|coding| !coding.is_empty() && !coding.eq_ignore_ascii_case("chunked"))
        .collect();
    if rest.is_empty() {
        None
    } else {
        Some(rest.join(", "))
    }
}

/// `timeout=N` parameter of a `Keep-Alive` header value.
pub fn keep_alive_timeout(value: &str) -> Option<Duration> {
    value.split(',').find_map(|param| {
        let (name, secs) = param.split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("timeout") {
            return None;
        }
        secs.trim().trim_matches('"').parse::<u64>().ok().map(Duration::from_secs)
    })
}
