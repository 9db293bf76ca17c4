//! HTTP request handlers.
//!
//! - [`process`]: download, separate and publish a track
//! - [`health`]: liveness check
//!
//! Handlers return [`crate::errors::Result`], so failures become `{"detail": ...}` JSON bodies
//! with the status code chosen by [`crate::errors::Error`].

pub mod health;
pub mod process;
