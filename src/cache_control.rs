//! Parsed `Cache-Control` directives.
//!
//! The resolver in [`crate::cache`] only ever sees headers through this
//! type. Parsing follows the header's comma-separated directive syntax,
//! including quoted parameters, and also honors `Pragma: no-cache` from
//! HTTP/1.0 era servers.

use std::fmt;

use http::header::HeaderMap;

/// Cache directives from a request or response header block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    no_cache: bool,
    no_store: bool,
    max_age: Option<u64>,
    max_stale: Option<u64>,
    min_fresh: Option<u64>,
    only_if_cached: bool,
    must_revalidate: bool,
    public: bool,
    private: bool,
}

impl CacheControl {
    /// Parse the directives found in `Cache-Control` and `Pragma`
    /// headers. Unknown directives are ignored.
    pub fn parse(headers: &HeaderMap) -> Self {
        let mut control = CacheControl::default();

        for (name, value) in headers.iter() {
            let name = name.as_str();
            if !name.eq_ignore_ascii_case("cache-control") && !name.eq_ignore_ascii_case("pragma")
            {
                continue;
            }
            let Ok(value) = value.to_str() else { continue };
            control.parse_directives(value);
        }

        control
    }

    fn parse_directives(&mut self, value: &str) {
        let bytes = value.as_bytes();
        let mut pos = 0;

        while pos < bytes.len() {
            let token_start = pos;
            pos = skip_until(value, pos, "=,;");
            let directive = value[token_start..pos].trim();

            let parameter = if pos == bytes.len() || bytes[pos] == b',' || bytes[pos] == b';' {
                pos += 1; // consume ',' or ';' (or end)
                None
            } else {
                pos += 1; // consume '='
                pos = skip_whitespace(value, pos);

                if pos < bytes.len() && bytes[pos] == b'"' {
                    pos += 1;
                    let start = pos;
                    pos = skip_until(value, pos, "\"");
                    let parameter = &value[start..pos];
                    pos += 1; // consume the closing quote
                    Some(parameter)
                } else {
                    let start = pos;
                    pos = skip_until(value, pos, ",;");
                    Some(value[start..pos].trim())
                }
            };

            self.apply(directive, parameter);
        }
    }

    fn apply(&mut self, directive: &str, parameter: Option<&str>) {
        if directive.eq_ignore_ascii_case("no-cache") {
            self.no_cache = true;
        } else if directive.eq_ignore_ascii_case("no-store") {
            self.no_store = true;
        } else if directive.eq_ignore_ascii_case("max-age") {
            self.max_age = parse_seconds(parameter);
        } else if directive.eq_ignore_ascii_case("max-stale") {
            // A bare max-stale accepts a response of any staleness.
            self.max_stale = parse_seconds(parameter).or(Some(u64::MAX));
        } else if directive.eq_ignore_ascii_case("min-fresh") {
            self.min_fresh = parse_seconds(parameter);
        } else if directive.eq_ignore_ascii_case("only-if-cached") {
            self.only_if_cached = true;
        } else if directive.eq_ignore_ascii_case("must-revalidate") {
            self.must_revalidate = true;
        } else if directive.eq_ignore_ascii_case("public") {
            self.public = true;
        } else if directive.eq_ignore_ascii_case("private") {
            self.private = true;
        }
    }

    /// The response must be revalidated with the origin before use.
    pub fn no_cache(&self) -> bool {
        self.no_cache
    }

    /// The message must not be stored by any cache.
    pub fn no_store(&self) -> bool {
        self.no_store
    }

    /// Freshness lifetime cap, in seconds.
    pub fn max_age(&self) -> Option<u64> {
        self.max_age
    }

    /// Staleness the requester will accept, in seconds.
    pub fn max_stale(&self) -> Option<u64> {
        self.max_stale
    }

    /// Freshness the requester demands beyond now, in seconds.
    pub fn min_fresh(&self) -> Option<u64> {
        self.min_fresh
    }

    /// The requester forbids going to the network.
    pub fn only_if_cached(&self) -> bool {
        self.only_if_cached
    }

    /// A stale response must not be served without revalidation.
    pub fn must_revalidate(&self) -> bool {
        self.must_revalidate
    }

    /// The response may be stored by shared caches.
    pub fn is_public(&self) -> bool {
        self.public
    }

    /// The response is for a single user only.
    pub fn is_private(&self) -> bool {
        self.private
    }
}

impl fmt::Display for CacheControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sep = "";
        let mut directive = |f: &mut fmt::Formatter<'_>, text: fmt::Arguments<'_>| {
            let result = write!(f, "{sep}{text}");
            sep = ", ";
            result
        };

        if self.no_cache {
            directive(f, format_args!("no-cache"))?;
        }
        if self.no_store {
            directive(f, format_args!("no-store"))?;
        }
        if let Some(seconds) = self.max_age {
            directive(f, format_args!("max-age={seconds}"))?;
        }
        if let Some(seconds) = self.max_stale {
            if seconds == u64::MAX {
                directive(f, format_args!("max-stale"))?;
            } else {
                directive(f, format_args!("max-stale={seconds}"))?;
            }
        }
        if let Some(seconds) = self.min_fresh {
            directive(f, format_args!("min-fresh={seconds}"))?;
        }
        if self.only_if_cached {
            directive(f, format_args!("only-if-cached"))?;
        }
        if self.must_revalidate {
            directive(f, format_args!("must-revalidate"))?;
        }
        if self.public {
            directive(f, format_args!("public"))?;
        }
        if self.private {
            directive(f, format_args!("private"))?;
        }

        Ok(())
    }
}

/// Index of the first character from `set` at or after `pos`, or the
/// end of the string.
fn skip_until(value: &str, pos: usize, set: &str) -> usize {
    value[pos..]
        .find(|c| set.contains(c))
        .map(|offset| pos + offset)
        .unwrap_or(value.len())
}

fn skip_whitespace(value: &str, mut pos: usize) -> usize {
    let bytes = value.as_bytes();
    while pos < bytes.len() && (bytes[pos] == b' ' || bytes[pos] == b'\t') {
        pos += 1;
    }
    pos
}

/// Parse a directive parameter as seconds, clamping overflow.
fn parse_seconds(parameter: Option<&str>) -> Option<u64> {
    let parameter = parameter?;
    if parameter.is_empty() || !parameter.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(parameter.parse::<u64>().unwrap_or(u64::MAX))
}
