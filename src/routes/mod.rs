//! HTTP route handlers.
//!
//! Handlers annotated with `#[openapi]` are collected by `rocket_okapi` into
//! the OpenAPI document. The upload handler streams a raw body and is mounted
//! with plain Rocket routing.

pub mod health;
pub mod imports;
