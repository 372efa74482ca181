//! Library crate for ospd-rs: the scan registry and the daemon around it.
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod ports;
pub mod registry;
pub mod server;
pub mod targets;
pub mod tls;
pub mod types;

pub use error::{RegistryError, RegistryResult};
pub use registry::ScanRegistry;
pub use types::{ResultKind, ScanOptions, ScanResult, ScanStatus, ScanSummary};
