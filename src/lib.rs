pub mod config;
pub mod core;
pub mod error;
pub mod inputs;
pub mod log;
pub mod orchestration;
pub mod pipeline;
pub mod transform;
pub mod util;

pub use error::{ConfigError, Error, Result};
pub use pipeline::Pipeline;
