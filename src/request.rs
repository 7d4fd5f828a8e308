//! The HTTP request type consumed by the core.
//!
//! Only the attributes the dispatcher, pool and cache resolver care
//! about live here: the method and URL, the header map, and an opaque
//! tag used to group calls for cancellation. Bodies are the transport
//! engine's business.

use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, Uri};

use crate::cache_control::CacheControl;

/// An immutable HTTP request.
///
/// Cloning is cheap enough for the core's purposes: redirect follow-ups
/// and conditional revalidation derive new requests from old ones via
/// [`Request::to_builder`].
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    url: Uri,
    headers: HeaderMap,
    tag: Option<String>,
}

impl Request {
    /// Start building a request.
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// A GET request for `url` with no headers.
    pub fn get(url: Uri) -> Self {
        Builder::default().url(url).build()
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request URL.
    pub fn url(&self) -> &Uri {
        &self.url
    }

    /// The host component of the URL, used for per-host dispatch caps.
    pub fn host(&self) -> &str {
        self.url.host().unwrap_or_default()
    }

    /// Whether this request travels over TLS.
    pub fn is_https(&self) -> bool {
        self.url.scheme() == Some(&http::uri::Scheme::HTTPS)
    }

    /// All request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The first value of the named header, if it is valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The tag grouping this request for [`Dispatcher::cancel`].
    ///
    /// [`Dispatcher::cancel`]: crate::Dispatcher::cancel
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// The request's parsed `Cache-Control` directives.
    pub fn cache_control(&self) -> CacheControl {
        CacheControl::parse(&self.headers)
    }

    /// A builder seeded with this request's fields.
    pub fn to_builder(&self) -> Builder {
        Builder {
            method: self.method.clone(),
            url: Some(self.url.clone()),
            headers: self.headers.clone(),
            tag: self.tag.clone(),
        }
    }

    pub(crate) fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

/// Builder for [`Request`].
#[derive(Debug, Clone)]
pub struct Builder {
    method: Method,
    url: Option<Uri>,
    headers: HeaderMap,
    tag: Option<String>,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            method: Method::GET,
            url: None,
            headers: HeaderMap::new(),
            tag: None,
        }
    }
}

impl Builder {
    /// Set the request method.
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Set the request URL.
    pub fn url(mut self, url: Uri) -> Self {
        self.url = Some(url);
        self
    }

    /// Set a header, replacing any previous value.
    ///
    /// # Panics
    ///
    /// Panics when the name or value is not a legal HTTP header.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        let name: HeaderName = name.parse().expect("invalid header name");
        let value: HeaderValue = value.parse().expect("invalid header value");
        self.headers.insert(name, value);
        self
    }

    /// Remove every value of a header.
    pub fn remove_header(mut self, name: &str) -> Self {
        if let Ok(name) = name.parse::<HeaderName>() {
            self.headers.remove(name);
        }
        self
    }

    /// Tag this request so it can be cancelled as a group.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Build the request.
    ///
    /// # Panics
    ///
    /// Panics when no URL was set.
    pub fn build(self) -> Request {
        Request {
            method: self.method,
            url: self.url.expect("request has no url"),
            headers: self.headers,
            tag: self.tag,
        }
    }
}
