//! HTTP gateway for Animo.
//!
//! Serves code generation, streamed chat generation through the agent loop,
//! scene rendering with progress streaming, and the published artifacts.

pub mod chat;
pub mod code;
pub mod error;
pub mod server;
pub mod state;
pub mod video;

pub use server::{router, start_gateway};
pub use state::GatewayState;
