pub mod engine;
pub mod rules;
pub mod window;

pub use engine::CorrelationEngine;
pub use rules::{
    register_builtin_rules, CorrelationContext, CorrelationRule, FanOutRule, RuleRegistry,
    SeverityEscalationRule, ThresholdRule,
};
pub use window::group_by_event_time;
