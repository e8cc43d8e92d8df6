// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

//! The scope record: the request context handed to the application host once
//! per request stream.
//!
//! # References
//! * [ASGI Specification - HTTP connection scope](https://asgi.readthedocs.io/en/latest/specs/www.html#http-connection-scope)

use std::net::SocketAddr;

/// The kind of scope being dispatched.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ScopeType {
    Http,
    Lifespan,
}

impl ScopeType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Lifespan => "lifespan",
        }
    }
}

/// The request context for one HTTP request stream.
///
/// Header names are lowercase and order is preserved from the wire.
/// `stream_id` identifies the HTTP/2 stream the request arrived on; it is a
/// protocol extension beyond standard ASGI and is only populated when the
/// engine is configured to expose it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Scope {
    pub scope_type: ScopeType,
    pub http_version: &'static str,
    pub method: String,
    pub scheme: String,
    pub path: String,
    pub query_string: Vec<u8>,
    pub authority: Option<String>,
    pub headers: Vec<(Vec<u8>, Vec<u8>)>,
    pub client: Option<SocketAddr>,
    pub server: Option<SocketAddr>,
    pub stream_id: Option<u32>,
}

impl Scope {
    /// An HTTP/2 scope with everything but the transport addresses filled in.
    pub fn http2(method: String, scheme: String, path: String, query_string: Vec<u8>,
            authority: Option<String>, headers: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
        Self {
            scope_type: ScopeType::Http,
            http_version: "2",
            method,
            scheme,
            path,
            query_string,
            authority,
            headers,
            client: None,
            server: None,
            stream_id: None,
        }
    }

    /// The first value of the named header, if present. Lookup is by the
    /// lowercase wire name.
    pub fn header(&self, name: &[u8]) -> Option<&[u8]> {
        self.headers.iter()
            .find(|(candidate, _)| candidate == name)
            .map(|(_, value)| value.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example_scope() -> Scope {
        Scope::http2(
            "GET".into(),
            "https".into(),
            "/search".into(),
            b"q=hello".to_vec(),
            Some("example.com".into()),
            vec![
                (b"accept".to_vec(), b"*/*".to_vec()),
                (b"cookie".to_vec(), b"a=1".to_vec()),
                (b"cookie".to_vec(), b"b=2".to_vec()),
            ],
        )
    }

    #[test]
    fn test_http2_scope_defaults() {
        let scope = example_scope();
        assert_eq!(scope.scope_type, ScopeType::Http);
        assert_eq!(scope.scope_type.as_str(), "http");
        assert_eq!(scope.http_version, "2");
        assert_eq!(scope.stream_id, None);
        assert_eq!(scope.client, None);
    }

    #[test]
    fn test_header_lookup_is_first_match() {
        let scope = example_scope();
        assert_eq!(scope.header(b"cookie"), Some(b"a=1".as_slice()));
        assert_eq!(scope.header(b"accept"), Some(b"*/*".as_slice()));
        assert_eq!(scope.header(b"x-missing"), None);
    }
}
