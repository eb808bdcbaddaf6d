//! Shared primitives for the netsentry capture-to-analysis pipeline:
//! flow identity, pooling, counters, and the top-level error type.

#![warn(missing_docs)]

pub mod error;
pub mod flow;
pub mod metrics;
pub mod pool;

pub use error::{AnalyzerError, SentryError, SentryResult};
pub use flow::{FlowKey, TcpState};
pub use metrics::{AtomicCounter, PipelineStats};
pub use pool::{Pool, Resettable};
