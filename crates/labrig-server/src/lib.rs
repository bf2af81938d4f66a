//! HTTP/JSON lock service for labrig test machines.
//!
//! Exposes acquire/release/query/register/update over a
//! [`labrig_storage::LockRegistry`]. This crate contains the server
//! framework, API schema types, error handling, and route definitions.

pub mod error;
pub mod handlers;
pub mod router;
pub mod schema;
pub mod service;
pub mod state;
