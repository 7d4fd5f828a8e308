//! Valet
//!
//! Valet parks your connections. It is the concurrency core of an HTTP
//! user agent: a [`Dispatcher`] that admits asynchronous calls under
//! global and per-host caps, a connection [`pool`] which re-uses live
//! transports and evicts the ones that have gone stale, and a
//! [`cache`] strategy resolver which decides, per RFC 7234, whether a
//! stored response can be served, revalidated, or must be refetched.
//!
//! Byte-level HTTP framing and TLS live elsewhere: valet talks to the
//! wire through the [`engine`] contract, and user code observes the
//! exchange through the [`interceptor`] chain.

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod arena;
pub mod cache;
pub mod cache_control;
pub mod call;
pub mod client;
pub mod dispatcher;
pub mod engine;
mod error;
pub mod interceptor;
pub mod pool;
pub mod request;
pub mod response;

pub use self::cache_control::CacheControl;
pub use self::call::{Call, Callback};
pub use self::client::Client;
pub use self::dispatcher::Dispatcher;
pub use self::error::{BoxError, Error};
pub use self::request::Request;
pub use self::response::{Handshake, Response};
