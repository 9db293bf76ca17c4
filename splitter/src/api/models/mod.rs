//! API request and response data models.
//!
//! All models are annotated with `utoipa` for the generated API docs.

pub mod health;
pub mod process;
