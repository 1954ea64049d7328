//! Image Service
//!
//! Accepts image uploads over HTTP, queues them on a durable job queue and
//! processes them in background workers (bounded thumbnails plus a
//! recompressed original), tracking each image through
//! NEW → PROCESSING → DONE | ERROR.

pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod models;
pub mod openapi;
pub mod services;
pub mod startup;
pub mod state;
pub mod storage;

#[cfg(test)]
mod test_support;

// Public re-exports
pub use config::Config;
pub use error::{AppError, Result};
pub use state::AppState;
