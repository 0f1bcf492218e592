pub mod api;
pub mod config;
pub mod error;
pub mod languages;
pub mod memory;
pub mod queue;
pub mod redis;
pub mod store;
pub mod types;

pub use error::{JudgeError, Result};
