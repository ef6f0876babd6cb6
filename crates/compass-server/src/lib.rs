//! Compass HTTP gateway.
//!
//! JSON routes under `/v1beta1` exposing the asset service, plus `/health`
//! and `/metrics`. Mutating routes resolve the caller from the identity
//! header before touching the service.

pub mod handlers;
pub mod server;

pub use server::{router, start_server, AppState};
