//! Shared HTTP DTOs for the AccelerBoat public API.
//!
//! Re-exported from `accelerboat-api-models` so API consumers share a single source
//! of truth for request/response shapes.

pub use accelerboat_api_models::*;
