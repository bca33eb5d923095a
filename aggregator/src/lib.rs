pub mod cache;
pub mod client;
pub mod domain;
pub mod options;
pub mod planes;
pub mod ports;
pub mod signature;
pub mod stats;

pub use client::ServiceControlClient;
pub use options::{
    CheckAggregationOptions, ClientOptions, MetricKindMap, QuotaAggregationOptions,
    ReportAggregationOptions,
};
pub use ports::{CheckTransport, QuotaTransport, ReportTransport, Transports};
pub use shared::{Error, Result};
pub use stats::{KindStatistics, Statistics};
