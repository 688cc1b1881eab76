//! # pixvault server
//!
//! HTTP front end and queue worker for the pixvault photo service.
//!
//! The server resolves single photos synchronously and turns searches into
//! queued tasks; the worker consumes those tasks and ingests the results.
//! Both paths draw from one [`AdmissionGate`](pixvault_core::AdmissionGate)
//! when they run in the same process.

pub mod handlers;
pub mod infra;
pub mod routes;

pub use infra::app_state::AppState;
pub use routes::create_app;
