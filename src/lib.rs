//! Trickster
//!
//! A read-through caching reverse proxy that accelerates queries to
//! time-series databases. Trickster sits between dashboards and an
//! upstream origin (Prometheus in-tree; other backends through the
//! client registry) and answers range queries from its cache, fetching
//! only the time ranges it has never seen.
//!
//! # Architecture
//!
//! - [`config`]: TOML configuration, immutable once loaded
//! - [`routing`]: per-origin route table with host and path routing
//! - [`frontend`]: the HTTP listener and request dispatch
//! - [`origin`]: per-backend clients behind the [`origin::OriginClient`]
//!   capability trait
//! - [`engines`]: the proxy engines, chiefly the delta proxy cache which
//!   computes and fetches only the uncached deltas of a range query, and
//!   the progressive collapsed forwarder which deduplicates concurrent
//!   identical fetches
//! - [`timeseries`]: the in-memory series model and extent arithmetic
//! - [`cache`]: the byte store abstraction and its size/TTL-bounded index

pub mod cache;
pub mod config;
pub mod engines;
pub mod error;
pub mod frontend;
pub mod headers;
pub mod metrics;
pub mod origin;
pub mod routing;
pub mod timeseries;

pub use config::{Config, Flags};
pub use error::{Result, TricksterError};
pub use frontend::ServerState;
pub use origin::{ClientRegistry, OriginClient, TimeseriesRequest};
pub use timeseries::{Extent, ExtentList, Timeseries};
