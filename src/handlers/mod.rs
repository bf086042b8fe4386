//! HTTP handlers for the gateway.

pub mod health_handlers;
pub mod object_handlers;
