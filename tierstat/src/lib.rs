//! # tierstat
//!
//! Multi-resolution rollup metrics over a key-value store.
//!
//! tierstat keeps every metric stream as one record holding a chain of
//! round-robin spans: 30-second buckets for the last five minutes, five-minute
//! buckets for the last hour, and so on up to a year. Buckets that age out of
//! a fine span are merged into the next coarser one, so storage per stream is
//! fixed no matter how much is emitted.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - Bounded storage per stream, set by the span configuration
//! - Lazy rollups: spans are only reconciled on write or read, never on a timer
//! - Optimistic concurrency: writers merge and retry on `seq` collisions
//! - Optional in-process buffering to batch hot metrics into one write
//! - Approximate percentiles from bounded per-bucket reservoirs
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use tierstat::{EmitOptions, Metrics, MetricsConfig, QueryOptions, Statistic};
//! use tierstat::dimensions::dimensions;
//! use tierstat::store::MemoryStore;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MetricsConfig::new("acme").with_p_resolution(100);
//! let metrics = Metrics::with_system_clock(config, Arc::new(MemoryStore::new()))?;
//!
//! let route = dimensions([("route", "/users")]);
//! metrics
//!     .emit("api", "latency", 42.0, &[route.clone()], EmitOptions::default())
//!     .await?;
//!
//! let p95 = metrics
//!     .query("api", "latency", &route, 3600, "p95".parse::<Statistic>()?, QueryOptions::accumulate())
//!     .await?;
//! assert_eq!(p95.value(), Some(42.0));
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`Metrics`]: Per-owner handle: emit, query, flush, list, upgrade
//! - [`MetricsRegistry`]: Shared cache of handles with flush-on-shutdown
//! - [`rollup::RollupEngine`]: Ring insertion and cross-span aging
//! - [`writer::Writer`]: Read-merge-write with conditional-put retry
//! - [`store::MetricStore`]: Backing store trait; memory and JSON file stores
//!
//! ## Modules
//!
//! - [`schema`]: Span configuration and the default hierarchy
//! - [`record`]: Records, spans and buckets
//! - [`dimensions`]: Canonical dimension encoding
//! - [`buffer`]: Pre-aggregation before persistence
//! - [`query`]: Span selection, statistics and series
//! - [`upgrade`]: Resampling into a new span layout
//! - [`listing`]: Namespace, metric and dimension discovery
//! - [`config`]: Instance configuration
//! - [`clock`]: Time sources
//! - [`error`]: Error types

pub mod buffer;
pub mod clock;
pub mod config;
pub mod dimensions;
pub mod error;
pub mod listing;
pub mod metrics;
pub mod query;
pub mod record;
pub mod registry;
pub mod rollup;
pub mod schema;
pub mod store;
pub mod upgrade;
pub mod writer;

// Re-export primary API types at crate root for convenience.
pub use buffer::BufferPolicy;
pub use config::{BackoffPolicy, MetricsConfig, Verbosity};
pub use dimensions::Dimensions;
pub use error::{MetricsError, Result};
pub use listing::MetricList;
pub use metrics::{EmitOptions, Metrics};
pub use query::{QueryOptions, QueryResult, Statistic};
pub use record::{MetricRecord, Point, RecordKey, Span};
pub use registry::MetricsRegistry;
pub use schema::{SpanConfig, SpanSet};
