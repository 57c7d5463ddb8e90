//! Reference transports and the connection multiplexer.
//!
//! [`HttpClientConnection`] performs outbound HTTP calls, [`MetricsConnection`]
//! keeps a Prometheus registry, and [`Multiplexer`] routes envelopes across
//! any set of [`Connection`](courier_types::Connection)s.

pub mod http_client;
pub mod metrics;
pub mod multiplexer;
pub mod queue;

pub use http_client::{HttpClientConnection, HttpClientSettings, HttpMessage, HttpPerformative};
pub use metrics::{
    MetricKind, MetricsConnection, MetricsMessage, MetricsPerformative, MetricsSettings,
    MetricsStore, UpdateOp,
};
pub use multiplexer::{Multiplexer, MultiplexerError};
pub use queue::InboundQueue;
