//! factcheck-server: REST + SSE surface over the audit engine.

pub mod error;
pub mod handlers;
pub mod router;
