pub mod app_state;
pub mod bootstrap;
pub mod config;
pub mod errors;
pub mod telemetry;
