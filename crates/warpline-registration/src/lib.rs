#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]

/// registration configuration.
pub mod config;

/// registration engine and multiresolution scheduler.
pub mod engine;

/// registration error types.
pub mod error;

/// paired landmark records and their exchange format.
pub mod landmarks;

/// damped quasi-Newton optimizer.
pub mod optimizer;

/// divergence/curl regularization operator.
pub mod regularization;

/// similarity energy and gradient evaluation.
pub mod similarity;

/// fitted transform, field sampling and persistence.
pub mod transform;

pub use config::RegistrationConfig;
pub use engine::{ElasticRegistration, ProgressCallback, RegistrationResult};
pub use error::RegistrationError;
pub use landmarks::{read_landmarks, write_landmarks, Landmark};
pub use regularization::RegularizationOperator;
pub use similarity::evaluate_image_similarity;
pub use transform::ElasticTransform;
