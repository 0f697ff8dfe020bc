//! Core types, config, errors, and the conversation model for Animo.

pub mod config;
pub mod conversation;
pub mod error;
pub mod types;
