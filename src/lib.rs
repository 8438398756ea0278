//! StreamVault: a tiered security event pipeline.
//!
//! Raw platform events are admitted per client (bronze), normalized and
//! field-encrypted (silver), then correlated into alerts by windowed
//! detection rules (gold). External systems (broker, storage, KMS,
//! telemetry) are reached through the contracts in [`infrastructure`].

pub mod application;
pub mod correlation;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod normalize;
pub mod pipeline;

pub use error::{ErrorCode, ErrorKind, PipelineError};
pub use infrastructure::config::Config;
