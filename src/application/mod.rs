pub mod alert_service;
pub mod audit_service;

pub use alert_service::AlertService;
pub use audit_service::AuditService;
