//! HTTP/1.x request view over an already-framed buffer.
//!
//! Parsing is only used to find the request path that keys the cache; the
//! bytes forwarded upstream are always the original buffer, untouched.

use percent_encoding::percent_decode_str;
use thiserror::Error;
use url::Url;

/// Errors that can occur while parsing a framed request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request headers are incomplete")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid request target: {0}")]
    InvalidTarget(String),
}

/// Read-only view of one parsed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestView {
    pub method: String,
    /// Request target exactly as sent.
    pub target: String,
    /// Percent-decoded URL path, without query or fragment.
    pub path: String,
    pub headers: Vec<(String, String)>,
}

impl RequestView {
    const MAX_HEADERS: usize = 64;

    /// Parse the request line and headers at the start of `buf`.
    pub fn parse(buf: &[u8]) -> Result<Self, RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_req = httparse::Request::new(&mut headers);

        if raw_req.parse(buf)?.is_partial() {
            return Err(RequestError::Incomplete);
        }

        let method = raw_req
            .method
            .ok_or(RequestError::MissingField { field: "method" })?;
        let target = raw_req
            .path
            .ok_or(RequestError::MissingField { field: "path" })?;
        let path = url_path(method, target)?;

        let headers = raw_req
            .headers
            .iter()
            .map(|h| {
                (
                    h.name.to_string(),
                    String::from_utf8_lossy(h.value).into_owned(),
                )
            })
            .collect();

        Ok(Self {
            method: method.to_string(),
            target: target.to_string(),
            path,
            headers,
        })
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Extract the decoded path component from a request target.
///
/// - origin-form (`/a?b`): the part before `?` or `#`
/// - absolute-form (`http://host/a`): the parsed URL's path
/// - authority-form (`CONNECT host:port`): no path
/// - asterisk-form (`OPTIONS *`): `*`
fn url_path(method: &str, target: &str) -> Result<String, RequestError> {
    let invalid = || RequestError::InvalidTarget(target.to_string());

    if target == "*" {
        return Ok("*".to_string());
    }

    if target.starts_with('/') {
        let raw_path = target.split(['?', '#']).next().unwrap_or_default();
        return Ok(decode_path(raw_path));
    }

    if method == "CONNECT" {
        let authority = Url::parse(&format!("http://{target}")).map_err(|_| invalid())?;
        if authority.host_str().is_none() || authority.path() != "/" {
            return Err(invalid());
        }
        return Ok(String::new());
    }

    let url = Url::parse(target).map_err(|_| invalid())?;
    if url.cannot_be_a_base() {
        return Err(invalid());
    }
    Ok(decode_path(url.path()))
}

/// Percent-decode a path.
///
/// Escapes that do not form valid UTF-8 (`/%FF`) keep the path in its
/// encoded form, so distinct raw paths never share a cache key. Malformed
/// escapes (`%zz`) pass through literally.
fn decode_path(raw_path: &str) -> String {
    match percent_decode_str(raw_path).decode_utf8() {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => raw_path.to_string(),
    }
}
