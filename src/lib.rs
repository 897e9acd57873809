//! Cellar cluster client core
//!
//! The connection, routing, and transport engine for Cellar, a distributed
//! document-oriented database. This crate speaks the cluster's binary
//! protocol for key/value traffic and HTTP/1.1 for the secondary services
//! (query, search, analytics, views, management), keeps a live view of the
//! cluster topology, and routes every operation to the node that owns it.
//!
//! # Features
//!
//! - **Topology-aware routing**: keys hash to partitions; partitions map to
//!   nodes; the router reacts to node additions, removals, and
//!   `not_my_vbucket` redirections without user involvement
//! - **Connection management**: one multiplexed binary session per node,
//!   pooled HTTP sessions per service with node affinity
//! - **Retry and backoff**: a uniform retry orchestrator with pluggable
//!   strategies and a controlled schedule for topology races
//! - **Collections**: names resolve to wire ids lazily, with concurrent
//!   lookups coalesced into a single probe
//! - **Streaming**: range scans and row-streaming HTTP results without
//!   buffering entire payloads
//! - **Application telemetry**: latency histograms and counters, reported
//!   over a reverse WebSocket to the cluster's collector
//!
//! # Quick Start
//!
//! Add to your `Cargo.toml`:
//! ```toml
//! [dependencies]
//! cellar-client = "0.6"
//! tokio = { version = "1", features = ["full"] }
//! ```
//!
//! ## Connecting and reading a document
//!
//! ```no_run
//! use cellar_client::{Cluster, ClusterOptions, Credentials, KeyOptions};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cluster = Cluster::connect(
//!     "cellar://db1.example.com,db2.example.com",
//!     ClusterOptions::default(),
//!     Credentials::new("app", "secret"),
//! )
//! .await?;
//!
//! let bucket = cluster.bucket("travel").await?;
//! let result = bucket.get(b"airline_10".to_vec(), KeyOptions::default()).await?;
//! println!("value: {} bytes, cas: {}", result.value.len(), result.cas);
//!
//! cluster.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Scanning a key range
//!
//! ```no_run
//! use cellar_client::range_scan::{RangeScan, RangeScanContinueOptions, RangeScanCreateOptions, ScanType};
//! use futures::StreamExt;
//!
//! # async fn example(bucket: cellar_client::Bucket) -> Result<(), Box<dyn std::error::Error>> {
//! let create = RangeScanCreateOptions::builder()
//!     .scan_type(ScanType::Range(RangeScan::default()))
//!     .ids_only(true)
//!     .build();
//! let mut items = std::pin::pin!(bucket.scan(create, RangeScanContinueOptions::builder().build()));
//! while let Some(item) = items.next().await {
//!     println!("key: {:?}", item?.key);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Module Organization
//!
//! - **Transport**: [`binary`], [`stream`], [`session`], [`http`]
//! - **Routing**: [`topology`], [`bucket`], [`collections`], [`retry`]
//! - **Surface**: [`cluster`], [`crud`], [`range_scan`], [`options`]
//! - **Telemetry**: [`telemetry`], [`websocket`]
//! - **Testing**: [`testing`] (an in-process mock node)

pub mod binary;
pub mod bucket;
pub mod cluster;
pub mod collections;
pub mod crud;
pub mod error;
pub mod http;
pub mod options;
pub mod range_scan;
pub mod retry;
pub mod sasl;
pub mod session;
pub mod stream;
pub mod telemetry;
pub mod testing;
pub mod topology;
pub mod websocket;

// Core entry points and error types
pub use cluster::{Cluster, CoreRequest, CoreResponse, KvRequest};
pub use error::{Error, Result};

// Connection configuration
pub use options::{ClusterOptions, ConnectionString, Credentials};

// Bucket routing and CRUD surface
pub use bucket::Bucket;
pub use crud::{
    CounterOptions, CounterResult, GetResult, KeyOptions, MutationResult, StoreOptions,
};

// Binary protocol building blocks
pub use binary::{Codec, DurabilityLevel, HelloFeature, Magic, Opcode, Packet, Status};

// Retry policy
pub use retry::{
    BestEffortRetryStrategy, FailFastRetryStrategy, RetryAction, RetryReason, RetryStrategy,
};

// Topology model
pub use topology::{Config, ServiceType};

// HTTP service requests
pub use http::{HttpResponse, ServiceRequest};

// Telemetry
pub use telemetry::{AppTelemetryMeter, AppTelemetryReporter};
