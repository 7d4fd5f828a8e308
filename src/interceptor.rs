//! Interceptors: observers wrapping the network exchange.
//!
//! Interceptors can watch, rewrite, and short-circuit requests and
//! responses. The chain carries an explicit position index rather than
//! nesting closures, so a long interceptor stack costs no stack depth:
//! each `proceed` hands the next interceptor a chain advanced by one,
//! and the link past the last interceptor performs the exchange.

use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::error::Error;
use crate::request::Request;
use crate::response::Response;

/// Observes and optionally rewrites one exchange.
pub trait Interceptor: Send + Sync {
    /// Handle the chain's request, usually by calling
    /// [`Chain::proceed`] exactly once.
    fn intercept<'a>(&'a self, chain: Chain<'a>) -> BoxFuture<'a, Result<Response, Error>>;
}

/// The link past the last interceptor: performs the actual exchange.
pub(crate) trait Terminal: Send + Sync {
    fn transmit(&self, request: Request) -> BoxFuture<'_, Result<Response, Error>>;
}

/// An interceptor chain positioned at one of its links.
pub struct Chain<'a> {
    interceptors: &'a [Arc<dyn Interceptor>],
    terminal: &'a dyn Terminal,
    index: usize,
    request: Request,
}

impl<'a> Chain<'a> {
    pub(crate) fn new(
        interceptors: &'a [Arc<dyn Interceptor>],
        terminal: &'a dyn Terminal,
        request: Request,
    ) -> Self {
        Self {
            interceptors,
            terminal,
            index: 0,
            request,
        }
    }

    /// The request as it stands at this link.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Pass `request` to the rest of the chain and return its response.
    pub fn proceed(self, request: Request) -> BoxFuture<'a, Result<Response, Error>> {
        if let Some(interceptor) = self.interceptors.get(self.index) {
            let interceptor = interceptor.clone();
            let next = Chain {
                interceptors: self.interceptors,
                terminal: self.terminal,
                index: self.index + 1,
                request,
            };
            Box::pin(async move { interceptor.intercept(next).await })
        } else {
            self.terminal.transmit(request)
        }
    }
}
