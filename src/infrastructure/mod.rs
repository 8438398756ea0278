pub mod bus;
pub mod config;
pub mod crypto;
pub mod kms;
pub mod storage;
pub mod telemetry;

pub use bus::{InMemoryBus, MessageBus, BRONZE_TOPIC, SILVER_TOPIC};
pub use config::Config;
pub use crypto::FieldEncryptor;
pub use kms::{Kms, LocalKms};
pub use storage::{partition_key, InMemoryStorage, StorageSink, Tier};
pub use telemetry::{NoopTelemetry, PipelineMetrics, TelemetrySink};
