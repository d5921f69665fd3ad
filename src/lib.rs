//! Interview Conductor — stage controller for a spoken two-stage mock
//! interview.

pub mod channels;
pub mod config;
pub mod error;
pub mod interview;
pub mod llm;
pub mod store;
