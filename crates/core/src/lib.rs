// Core execution and governance engine for LogLine workflows

pub mod agent;
pub mod apps;
pub mod budget;
pub mod error;
pub mod events;
pub mod metrics;
pub mod policy;
pub mod retry;
pub mod storage;
pub mod tools;
pub mod types;
pub mod workflow;

pub use error::{EngineError, FieldError};
pub use types::*;
