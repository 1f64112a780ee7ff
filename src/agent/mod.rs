//! Agent side of the live link: local sampling plus the resilient transport.

pub mod backoff;
pub mod client;
pub mod producer;

pub use backoff::Backoff;
pub use client::{ClientConfig, ClientError, LinkState, TransportClient};
pub use producer::{
    CollectError, HostProbe, MetricProducer, Publisher, SysinfoProbe, check_alerts,
};
