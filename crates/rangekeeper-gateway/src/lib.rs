//! rangekeeper-gateway — HTTP control plane for the sandbox orchestrator
//!
//! Exposes command execution, pool management, security administration, and
//! network inspection over a JSON REST API.

pub mod protocol;
pub mod server;

pub use server::{AppState, create_router, serve};
