pub mod access;
pub mod config;
pub mod context;
pub mod datasets;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod orchestrator;
pub mod remap;
