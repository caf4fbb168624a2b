#![forbid(unsafe_code)]

pub mod error;
pub mod grading;
pub mod mastery;
pub mod model;
pub mod time;

pub use error::{Error, ErrorKind};
pub use time::Clock;
