pub mod config;
pub mod error;
pub mod metrics;
pub mod routes;

pub use routes::{router, AppState};
