pub mod admission;
pub mod circuit;
pub mod coordinator;
pub mod normalizer;

pub use admission::{AdmissionController, TokenBucket};
pub use circuit::{CircuitBreaker, CircuitState};
pub use coordinator::{HealthStatus, PipelineCoordinator};
pub use normalizer::NormalizerPipeline;
