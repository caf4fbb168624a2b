mod arbiter;
mod grader;
mod sweep;

// Public API of the attempt lifecycle.
pub use crate::error::AttemptServiceError;
pub use arbiter::AttemptArbiter;
pub use grader::SessionGrader;
pub use sweep::{ExpirySweep, SweepReport};
