pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod queue;
pub mod server;
pub mod session;
pub mod swap;
pub mod task;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
