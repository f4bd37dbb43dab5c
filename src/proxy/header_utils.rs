//! Header handling for the proxy path.

use axum::http::HeaderMap;

/// Hop-by-hop headers are stripped in both directions; `host` is rebuilt
/// from the backend URL on the way out.
fn is_hop_by_hop(name: &str) -> bool {
    name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("keep-alive")
        || name.eq_ignore_ascii_case("proxy-authenticate")
        || name.eq_ignore_ascii_case("proxy-authorization")
        || name.eq_ignore_ascii_case("te")
        || name.eq_ignore_ascii_case("trailers")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("upgrade")
}

/// Whether a request header should be forwarded to the backend.
///
/// `content-length` is dropped as well: the body is re-framed by the
/// streaming client.
pub fn should_forward_request_header(name: &str) -> bool {
    !(is_hop_by_hop(name)
        || name.eq_ignore_ascii_case("host")
        || name.eq_ignore_ascii_case("content-length"))
}

/// Copy backend response headers, dropping hop-by-hop ones.
pub fn preserve_response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in upstream.iter() {
        if !is_hop_by_hop(name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn test_hop_by_hop_request_headers_dropped() {
        assert!(!should_forward_request_header("Connection"));
        assert!(!should_forward_request_header("transfer-encoding"));
        assert!(!should_forward_request_header("Host"));
        assert!(!should_forward_request_header("content-length"));

        assert!(should_forward_request_header("accept"));
        assert!(should_forward_request_header("authorization"));
        assert!(should_forward_request_header("x-custom"));
    }

    #[test]
    fn test_response_headers_preserved() {
        let mut upstream = HeaderMap::new();
        upstream.insert("content-type", HeaderValue::from_static("application/json"));
        upstream.insert("x-backend", HeaderValue::from_static("b1"));
        upstream.insert("connection", HeaderValue::from_static("close"));
        upstream.insert("transfer-encoding", HeaderValue::from_static("chunked"));

        let preserved = preserve_response_headers(&upstream);
        assert_eq!(preserved.get("content-type").unwrap(), "application/json");
        assert_eq!(preserved.get("x-backend").unwrap(), "b1");
        assert!(preserved.get("connection").is_none());
        assert!(preserved.get("transfer-encoding").is_none());
    }
}
