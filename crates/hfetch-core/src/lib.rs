//! Bounded-concurrency, non-blocking HTTPS retrieval.
//!
//! The engine runs a single reactor thread that multiplexes up to a fixed
//! number of concurrent fetches over non-blocking sockets. Callers talk to
//! it through [`Fetcher`]: submit [`FetchJob`]s carrying a URL, an optional
//! `If-Modified-Since` timestamp, and a sink for the body; collect
//! [`FetchResult`]s as fetches settle. Redirects, candidate-address
//! failover, conditional GETs, and per-step timeouts are handled inside.

pub mod config;
pub(crate) mod conn;
pub mod error;
pub mod job;
pub(crate) mod linebuf;
pub mod resolver;
pub mod tls;
pub mod uri;
pub(crate) mod wire;

mod reactor;

pub use config::FetcherConfig;
pub use error::{FetchError, ProtocolError};
pub use job::{FetchJob, FetchOutcome, FetchResult, Sink};
pub use reactor::Fetcher;
