//! The HTTP response type consumed by the core.
//!
//! Responses carry the two wire timestamps the cache resolver's age
//! arithmetic needs, and a record of the TLS handshake when the
//! exchange was encrypted. When a response is written to the cache the
//! timestamps round-trip through a pair of private extension headers.

use bytes::Bytes;
use http::header::HeaderMap;
use http::StatusCode;

use crate::cache_control::CacheControl;
use crate::request::Request;

/// Extension header recording when the cached request was first sent.
pub(crate) const SENT_MILLIS: &str = "x-valet-sent-millis";

/// Extension header recording when the cached response was first received.
pub(crate) const RECEIVED_MILLIS: &str = "x-valet-received-millis";

/// Record of the TLS handshake a response arrived over.
///
/// Certificate validation happens in the transport; the core only needs
/// to know that a handshake was captured so HTTPS responses without one
/// are never served from cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    tls_version: String,
    cipher_suite: String,
}

impl Handshake {
    /// Record a completed handshake.
    pub fn new(tls_version: impl Into<String>, cipher_suite: impl Into<String>) -> Self {
        Self {
            tls_version: tls_version.into(),
            cipher_suite: cipher_suite.into(),
        }
    }

    /// The negotiated TLS version.
    pub fn tls_version(&self) -> &str {
        &self.tls_version
    }

    /// The negotiated cipher suite.
    pub fn cipher_suite(&self) -> &str {
        &self.cipher_suite
    }
}

/// An HTTP response.
#[derive(Debug, Clone)]
pub struct Response {
    request: Request,
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    handshake: Option<Handshake>,
    sent_request_millis: u64,
    received_response_millis: u64,
}

impl Response {
    /// Start building a response.
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// The request that produced this response.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// The response status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// All response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The first value of the named header, if it is valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The response body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// The TLS handshake this response arrived over, if any.
    pub fn handshake(&self) -> Option<&Handshake> {
        self.handshake.as_ref()
    }

    /// Wall-clock milliseconds when the request was sent.
    pub fn sent_request_millis(&self) -> u64 {
        self.sent_request_millis
    }

    /// Wall-clock milliseconds when the response headers were received.
    pub fn received_response_millis(&self) -> u64 {
        self.received_response_millis
    }

    /// The response's parsed `Cache-Control` directives.
    pub fn cache_control(&self) -> CacheControl {
        CacheControl::parse(&self.headers)
    }

    /// A builder seeded with this response's fields.
    pub fn to_builder(&self) -> Builder {
        Builder {
            request: Some(self.request.clone()),
            status: self.status,
            headers: self.headers.clone(),
            body: self.body.clone(),
            handshake: self.handshake.clone(),
            sent_request_millis: self.sent_request_millis,
            received_response_millis: self.received_response_millis,
        }
    }
}

/// Builder for [`Response`].
#[derive(Debug, Clone)]
pub struct Builder {
    request: Option<Request>,
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    handshake: Option<Handshake>,
    sent_request_millis: u64,
    received_response_millis: u64,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            request: None,
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            handshake: None,
            sent_request_millis: 0,
            received_response_millis: 0,
        }
    }
}

impl Builder {
    /// Set the request this response answers.
    pub fn request(mut self, request: Request) -> Self {
        self.request = Some(request);
        self
    }

    /// Set the status code.
    pub fn status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    /// Set a header, replacing any previous value.
    ///
    /// # Panics
    ///
    /// Panics when the name or value is not a legal HTTP header.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        let name: http::header::HeaderName = name.parse().expect("invalid header name");
        let value: http::header::HeaderValue = value.parse().expect("invalid header value");
        self.headers.insert(name, value);
        self
    }

    /// Append a header, keeping previous values.
    ///
    /// # Panics
    ///
    /// Panics when the name or value is not a legal HTTP header.
    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        let name: http::header::HeaderName = name.parse().expect("invalid header name");
        let value: http::header::HeaderValue = value.parse().expect("invalid header value");
        self.headers.append(name, value);
        self
    }

    /// Set the body bytes.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Record the TLS handshake.
    pub fn handshake(mut self, handshake: Handshake) -> Self {
        self.handshake = Some(handshake);
        self
    }

    /// Record when the request was sent, in wall-clock milliseconds.
    pub fn sent_request_millis(mut self, millis: u64) -> Self {
        self.sent_request_millis = millis;
        self
    }

    /// Record when the response headers arrived, in wall-clock milliseconds.
    pub fn received_response_millis(mut self, millis: u64) -> Self {
        self.received_response_millis = millis;
        self
    }

    /// Build the response.
    ///
    /// # Panics
    ///
    /// Panics when no request was set.
    pub fn build(self) -> Response {
        Response {
            request: self.request.expect("response has no request"),
            status: self.status,
            headers: self.headers,
            body: self.body,
            handshake: self.handshake,
            sent_request_millis: self.sent_request_millis,
            received_response_millis: self.received_response_millis,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_round_trip() {
        let request = Request::get("https://example.com/".parse().unwrap());
        let response = Response::builder()
            .request(request)
            .status(StatusCode::NOT_MODIFIED)
            .header("etag", "\"v1\"")
            .handshake(Handshake::new("TLSv1.3", "TLS_AES_128_GCM_SHA256"))
            .sent_request_millis(100)
            .received_response_millis(250)
            .build();

        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
        assert_eq!(response.header("ETag"), Some("\"v1\""));
        assert_eq!(response.handshake().unwrap().tls_version(), "TLSv1.3");
        assert_eq!(response.sent_request_millis(), 100);
        assert_eq!(response.received_response_millis(), 250);

        let warned = response.to_builder().add_header("warning", "110 - stale").build();
        assert_eq!(warned.header("warning"), Some("110 - stale"));
        assert_eq!(warned.status(), StatusCode::NOT_MODIFIED);
    }
}
