pub mod audit;
pub mod bronze;
pub mod gold;
pub mod security;
pub mod silver;

pub use audit::{verify_chain, AuditRecord};
pub use bronze::{BronzeEvent, SourcePlatform, MAX_PAYLOAD_BYTES, SCHEMA_VERSION};
pub use gold::{AlertStatus, GoldAlert, Severity, StatusTransition};
pub use security::{
    Classification, ComplianceMetadata, SecurityContext, SecurityMetadata, Sensitivity,
    SensitiveFieldPolicy, ThreatLevel,
};
pub use silver::{EncryptedValue, SilverEvent, MAX_FIELD_LENGTH};
