//! `dagflow-core`: the declarative workflow engine.
//!
//! A [`document`] is [`plan::validate`]d into a [`plan::Plan`]; an
//! [`executor::Executor`] runs the plan against a seeded [`environment::Environment`],
//! dispatching each ready node to its [`handlers::NodeHandler`] and folding
//! the result back into the environment until every node is terminal.

pub mod adapters;
pub mod config;
pub mod dataflow;
pub mod document;
pub mod environment;
pub mod error;
pub mod executor;
pub mod handlers;
pub mod plan;
pub mod record;
pub mod template;

pub use error::{Result, WorkflowError};

use tracing::info;

/// Initialise a default tracing subscriber for the library consumer.
///
/// Call this once at program start. Uses `RUST_LOG` env var for filtering,
/// defaulting to `info` level.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt().with_env_filter(filter).init();

    info!("dagflow tracing initialised");
}
