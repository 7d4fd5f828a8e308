//! Cache strategy resolution.
//!
//! Given a stored response and the request now being made, [`Factory`]
//! decides between three courses: serve the cached response as-is, send
//! a conditional request and use the cached response on a 304, or go to
//! the network outright. The decision is a pure function of the inputs
//! and the injected clock; nothing here touches the network or mutates
//! its arguments.
//!
//! The arithmetic follows RFC 7234: a response's age is its reported
//! `Age` plus transit and residence time, and its freshness lifetime
//! comes from `max-age`, then `Expires`, then the `Last-Modified`
//! heuristic, in that order.

use http::header::{HeaderValue, IF_MODIFIED_SINCE, IF_NONE_MATCH};

use crate::cache_control::CacheControl;
use crate::request::Request;
use crate::response::{Response, RECEIVED_MILLIS, SENT_MILLIS};

const ONE_DAY_MILLIS: u128 = 24 * 60 * 60 * 1000;

/// The outcome of resolving a request against a cached response.
///
/// Exactly four shapes are meaningful:
///
/// | network request | cache response | meaning |
/// |---|---|---|
/// | present | absent  | go to the network, the cache cannot help |
/// | absent  | present | serve from cache without touching the network |
/// | present | present | revalidate; on a 304 the cached response stands |
/// | absent  | absent  | `only-if-cached` and the cache is insufficient |
#[derive(Debug, Clone)]
pub struct CacheStrategy {
    network_request: Option<Request>,
    cache_response: Option<Response>,
}

impl CacheStrategy {
    fn new(network_request: Option<Request>, cache_response: Option<Response>) -> Self {
        Self {
            network_request,
            cache_response,
        }
    }

    /// The request to send on the network, or `None` if this call does
    /// not use the network.
    pub fn network_request(&self) -> Option<&Request> {
        self.network_request.as_ref()
    }

    /// The cached response to return or validate, or `None` if this
    /// call does not use the cache.
    pub fn cache_response(&self) -> Option<&Response> {
        self.cache_response.as_ref()
    }

    /// Split the strategy into its parts.
    pub fn into_parts(self) -> (Option<Request>, Option<Response>) {
        (self.network_request, self.cache_response)
    }

    /// Returns `true` if `response` can be stored to later serve a
    /// request like `request`.
    ///
    /// Partial content is not supported, so the status allowlist is
    /// fixed; redirect codes 302 and 307 additionally need an explicit
    /// expiration or cacheability directive.
    pub fn is_cacheable(response: &Response, request: &Request) -> bool {
        let response_caching = response.cache_control();
        match response.status().as_u16() {
            200 | 203 | 204 | 300 | 301 | 404 | 405 | 410 | 414 | 501 | 308 => {}

            302 | 307 => {
                // s-maxage is deliberately not consulted: this is a
                // private cache.
                if response.header("Expires").is_none()
                    && response_caching.max_age().is_none()
                    && !response_caching.is_public()
                    && !response_caching.is_private()
                {
                    return false;
                }
            }

            _ => return false,
        }

        !response_caching.no_store() && !request.cache_control().no_store()
    }
}

/// Resolves a [`CacheStrategy`] for one request / cached-response pair.
pub struct Factory {
    now_millis: u64,
    request: Request,
    cache_response: Option<Response>,

    /// The server's clock when the cached response was served.
    served_date: Option<u64>,
    served_date_value: Option<HeaderValue>,

    /// The cached response's `Last-Modified`, verbatim and parsed.
    last_modified: Option<u64>,
    last_modified_value: Option<HeaderValue>,

    /// Expiration instant; `max-age` wins over this when both are set.
    expires: Option<u64>,

    /// When the cached exchange left and returned, from the private
    /// extension headers when present.
    sent_request_millis: u64,
    received_response_millis: u64,

    etag: Option<HeaderValue>,
    age_seconds: Option<u64>,
}

impl Factory {
    /// Gather the cached response's validators and timestamps.
    ///
    /// `now_millis` is the caller's wall clock; it is the only notion
    /// of "now" the resolver ever sees.
    pub fn new(now_millis: u64, request: Request, cache_response: Option<Response>) -> Self {
        let mut factory = Self {
            now_millis,
            request,
            cache_response,
            served_date: None,
            served_date_value: None,
            last_modified: None,
            last_modified_value: None,
            expires: None,
            sent_request_millis: 0,
            received_response_millis: 0,
            etag: None,
            age_seconds: None,
        };

        if let Some(response) = &factory.cache_response {
            factory.sent_request_millis = response.sent_request_millis();
            factory.received_response_millis = response.received_response_millis();

            for (name, value) in response.headers().iter() {
                let name = name.as_str();
                if name.eq_ignore_ascii_case("date") {
                    factory.served_date = parse_date_millis(value);
                    factory.served_date_value = Some(value.clone());
                } else if name.eq_ignore_ascii_case("expires") {
                    factory.expires = parse_date_millis(value);
                } else if name.eq_ignore_ascii_case("last-modified") {
                    factory.last_modified = parse_date_millis(value);
                    factory.last_modified_value = Some(value.clone());
                } else if name.eq_ignore_ascii_case("etag") {
                    factory.etag = Some(value.clone());
                } else if name.eq_ignore_ascii_case("age") {
                    factory.age_seconds = parse_seconds(value);
                } else if name.eq_ignore_ascii_case(SENT_MILLIS) {
                    if let Some(millis) = parse_millis(value) {
                        factory.sent_request_millis = millis;
                    }
                } else if name.eq_ignore_ascii_case(RECEIVED_MILLIS) {
                    if let Some(millis) = parse_millis(value) {
                        factory.received_response_millis = millis;
                    }
                }
            }
        }

        factory
    }

    /// Resolve the strategy.
    pub fn get(self) -> CacheStrategy {
        let only_if_cached = self.request.cache_control().only_if_cached();
        let candidate = self.candidate();

        if candidate.network_request.is_some() && only_if_cached {
            // Forbidden from using the network, and the cache is not
            // good enough.
            return CacheStrategy::new(None, None);
        }

        candidate
    }

    /// The strategy to use assuming the request may touch the network.
    fn candidate(self) -> CacheStrategy {
        let Some(cache_response) = self.cache_response.clone() else {
            return CacheStrategy::new(Some(self.request), None);
        };

        // An HTTPS response missing its handshake record cannot be
        // trusted, however fresh it looks.
        if self.request.is_https() && cache_response.handshake().is_none() {
            return CacheStrategy::new(Some(self.request), None);
        }

        if !CacheStrategy::is_cacheable(&cache_response, &self.request) {
            return CacheStrategy::new(Some(self.request), None);
        }

        let request_caching = self.request.cache_control();
        if request_caching.no_cache() || has_conditions(&self.request) {
            // The caller insists on the server's opinion.
            return CacheStrategy::new(Some(self.request), None);
        }

        let age_millis = self.cache_response_age() as u128;
        let mut fresh_millis = self.freshness_lifetime() as u128;

        if let Some(seconds) = request_caching.max_age() {
            fresh_millis = fresh_millis.min(to_millis(seconds));
        }

        let min_fresh_millis = request_caching.min_fresh().map(to_millis).unwrap_or(0);

        let response_caching = cache_response.cache_control();
        let mut max_stale_millis = 0;
        if !response_caching.must_revalidate() {
            if let Some(seconds) = request_caching.max_stale() {
                max_stale_millis = to_millis(seconds);
            }
        }

        if !response_caching.no_cache()
            && age_millis + min_fresh_millis < fresh_millis + max_stale_millis
        {
            let mut builder = cache_response.to_builder();
            if age_millis + min_fresh_millis >= fresh_millis {
                builder = builder.add_header("Warning", "110 valet \"Response is stale\"");
            }
            if age_millis > ONE_DAY_MILLIS && self.is_freshness_lifetime_heuristic() {
                builder = builder.add_header("Warning", "113 valet \"Heuristic expiration\"");
            }
            return CacheStrategy::new(None, Some(builder.build()));
        }

        // Stale or uncertain; ask the server, presenting whichever
        // validator the cached response carries.
        let conditional_request;
        let cached = if let Some(etag) = &self.etag {
            conditional_request = self
                .request
                .clone()
                .with_header(IF_NONE_MATCH, etag.clone());
            true
        } else if let Some(last_modified) = &self.last_modified_value {
            conditional_request = self
                .request
                .clone()
                .with_header(IF_MODIFIED_SINCE, last_modified.clone());
            true
        } else if let Some(served) = &self.served_date_value {
            conditional_request = self
                .request
                .clone()
                .with_header(IF_MODIFIED_SINCE, served.clone());
            true
        } else {
            conditional_request = self.request.clone();
            false
        };

        if cached {
            CacheStrategy::new(Some(conditional_request), Some(cache_response))
        } else {
            CacheStrategy::new(Some(conditional_request), None)
        }
    }

    /// Milliseconds the cached response stays fresh for, counted from
    /// its served date.
    fn freshness_lifetime(&self) -> u64 {
        let cache_response = self
            .cache_response
            .as_ref()
            .expect("freshness of a missing response");

        let response_caching = cache_response.cache_control();
        if let Some(seconds) = response_caching.max_age() {
            return seconds.saturating_mul(1000);
        }

        if let Some(expires) = self.expires {
            let served = self.served_date.unwrap_or(self.received_response_millis);
            return expires.saturating_sub(served);
        }

        if self.last_modified.is_some() && cache_response.request().url().query().is_none() {
            // One tenth of the document's age when served, per the
            // RFC's heuristic. Never applied to URLs with queries.
            let served = self.served_date.unwrap_or(self.sent_request_millis);
            let delta = served.saturating_sub(self.last_modified.unwrap());
            return delta / 10;
        }

        0
    }

    /// The cached response's current age in milliseconds, per RFC 7234
    /// §4.2.3.
    fn cache_response_age(&self) -> u64 {
        let apparent_received_age = self
            .served_date
            .map(|served| self.received_response_millis.saturating_sub(served))
            .unwrap_or(0);

        let received_age = self
            .age_seconds
            .map(|seconds| apparent_received_age.max(seconds.saturating_mul(1000)))
            .unwrap_or(apparent_received_age);

        let response_duration = self
            .received_response_millis
            .saturating_sub(self.sent_request_millis);
        let resident_duration = self.now_millis.saturating_sub(self.received_response_millis);

        received_age
            .saturating_add(response_duration)
            .saturating_add(resident_duration)
    }

    /// Whether [`Factory::freshness_lifetime`] fell through to the
    /// `Last-Modified` heuristic. Heuristically-fresh responses served
    /// past 24 hours of age must carry a warning.
    fn is_freshness_lifetime_heuristic(&self) -> bool {
        let cache_response = self.cache_response.as_ref().expect("missing response");
        cache_response.cache_control().max_age().is_none() && self.expires.is_none()
    }
}

/// Whether the request already carries validators of its own. Requests
/// enqueued with their own conditions bypass the cache entirely.
fn has_conditions(request: &Request) -> bool {
    request.header("If-Modified-Since").is_some() || request.header("If-None-Match").is_some()
}

fn to_millis(seconds: u64) -> u128 {
    (seconds as u128) * 1000
}

fn parse_date_millis(value: &HeaderValue) -> Option<u64> {
    let text = value.to_str().ok()?;
    let time = httpdate::parse_http_date(text).ok()?;
    let since_epoch = time.duration_since(std::time::UNIX_EPOCH).ok()?;
    Some(since_epoch.as_millis() as u64)
}

fn parse_seconds(value: &HeaderValue) -> Option<u64> {
    let text = value.to_str().ok()?;
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(text.parse::<u64>().unwrap_or(u64::MAX))
}

fn parse_millis(value: &HeaderValue) -> Option<u64> {
    value.to_str().ok()?.parse().ok()
}
