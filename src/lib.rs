pub mod artifact;
pub mod client;
pub mod config;
pub mod dag;
pub mod encoder;
pub mod errors;
pub mod gateway;
pub mod job;
pub mod pipeline;
pub mod store;
pub mod telemetry;
pub mod ui;

// Shared wire types, re-exported so binaries and tests need one import path.
pub use reelsmith_common as common;
