//! API layer for HTTP request handling and data models.
//!
//! - **[`handlers`]**: Axum route handlers for `/process` and `/health`
//! - **[`models`]**: Request/response data structures for API communication
//!
//! OpenAPI documentation is served at `/docs` when the server is running.

pub mod handlers;
pub mod models;
