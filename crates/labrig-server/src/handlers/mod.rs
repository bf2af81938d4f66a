//! HTTP handler modules for the lock API.
//!
//! Each sub-module implements thin handlers that parse requests, delegate to
//! [`crate::service::LockService`], and return JSON responses. No business
//! logic lives in handlers.

pub mod locks;
pub mod machines;
