pub mod mapper;
pub mod transformer;
pub mod validator;

pub use mapper::{is_network_event, FieldMapper};
pub use transformer::{FieldTransform, Transformer};
pub use validator::{EventValidator, FailureClass, MAX_JSON_DEPTH};
