//! IOC/signature matching: four independent tables (IP, botnet IP+port,
//! tracker URL, certificate SHA-1) joined against a provider registry, plus
//! a feed updater that pulls each provider's source and applies its regex.

#![warn(missing_docs)]

pub mod detector;
pub mod update;

pub use detector::{Detect, Request, SignatureDetector};
pub use update::{FeedUpdater, Provider, ProviderType};
