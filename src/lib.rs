pub mod commands;
pub mod data;
pub mod error;
pub mod models;
pub mod services;
pub mod state;

pub use commands::organize_pipeline::{
    organize_bookmarks_batch, PipelineCtx, RunOutcome, BATCH_SIZE,
};
pub use error::AppError;
pub use state::AppState;

use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "marksmith=info";

/// Installs a fmt subscriber filtered by `RUST_LOG`, falling back to
/// `marksmith=info`. Safe to call more than once.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_err()
    {
        tracing::debug!("global tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn init_logging_is_idempotent() {
        super::init_logging();
        super::init_logging();
    }
}
