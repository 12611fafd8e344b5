//! URL utilities for consistent URL handling
//!
//! Normalizes base URLs before appending endpoint paths, and resolves the
//! endpoint URLs that legacy SSE servers advertise relative to the stream
//! origin.

/// Normalize a base URL by removing trailing slashes
///
/// # Examples
///
/// ```
/// use banter::utils::url::normalize_base_url;
///
/// assert_eq!(normalize_base_url("https://api.example.com/v1"), "https://api.example.com/v1");
/// assert_eq!(normalize_base_url("https://api.example.com/v1/"), "https://api.example.com/v1");
/// ```
pub fn normalize_base_url(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

/// Construct a complete API endpoint URL from a base URL and endpoint path
///
/// # Examples
///
/// ```
/// use banter::utils::url::construct_api_url;
///
/// assert_eq!(
///     construct_api_url("https://api.example.com/v1/", "chat/completions"),
///     "https://api.example.com/v1/chat/completions"
/// );
/// ```
pub fn construct_api_url(base_url: &str, endpoint: &str) -> String {
    let normalized_base = normalize_base_url(base_url);
    let endpoint = endpoint.trim_start_matches('/');
    format!("{}/{}", normalized_base, endpoint)
}

/// Extract the `scheme://host[:port]` origin of a URL, without the path.
pub fn origin_of(url: &str) -> Option<&str> {
    let scheme_end = url.find("://")?;
    let rest = &url[scheme_end + 3..];
    if rest.is_empty() {
        return None;
    }
    match rest.find('/') {
        Some(path_start) => Some(&url[..scheme_end + 3 + path_start]),
        None => Some(url),
    }
}

/// Resolve an endpoint advertised by a legacy SSE server against the URL the
/// stream was opened on. Servers send absolute URLs, absolute paths, or
/// (non-conformant ones) bare relative paths.
pub fn resolve_endpoint_url(stream_url: &str, endpoint: &str) -> String {
    let endpoint = endpoint.trim();
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return endpoint.to_string();
    }
    let origin = origin_of(stream_url).unwrap_or(stream_url);
    if endpoint.starts_with('/') {
        format!("{}{}", origin, endpoint)
    } else {
        construct_api_url(origin, endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_trailing_slashes() {
        assert_eq!(
            normalize_base_url("https://api.example.com/v1///"),
            "https://api.example.com/v1"
        );
        assert_eq!(normalize_base_url(""), "");
    }

    #[test]
    fn constructs_api_urls_without_double_slashes() {
        assert_eq!(
            construct_api_url("https://api.example.com/v1/", "/chat/completions"),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(
            construct_api_url("https://api.example.com/v1", "models"),
            "https://api.example.com/v1/models"
        );
    }

    #[test]
    fn extracts_origins() {
        assert_eq!(
            origin_of("https://mcp.example.com:8002/sse"),
            Some("https://mcp.example.com:8002")
        );
        assert_eq!(
            origin_of("http://localhost:8002"),
            Some("http://localhost:8002")
        );
        assert_eq!(origin_of("not-a-url"), None);
    }

    #[test]
    fn resolves_endpoint_variants() {
        let sse = "http://localhost:8002/sse";
        assert_eq!(
            resolve_endpoint_url(sse, "/messages/?session_id=abc"),
            "http://localhost:8002/messages/?session_id=abc"
        );
        assert_eq!(
            resolve_endpoint_url(sse, "http://other.example.com/messages"),
            "http://other.example.com/messages"
        );
        assert_eq!(
            resolve_endpoint_url(sse, "messages"),
            "http://localhost:8002/messages"
        );
    }
}
