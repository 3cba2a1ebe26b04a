#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod file;

use anyhow::{Context as _, Result};
use tracing::{Subscriber, subscriber::DefaultGuard};
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, filter::ParseError, layer::SubscriberExt as _,
    util::SubscriberInitExt as _,
};

/// Registers a global subscriber with stdout logging and `additional_layer`.
pub fn setup_global_subscriber<L>(directives: &str, additional_layer: L) -> Result<()>
where
    L: Layer<Registry> + Send + Sync,
{
    let subscriber = Registry::default()
        .with(additional_layer.with_filter(try_filter(directives)?))
        .with(tracing_subscriber::fmt::layer().with_filter(try_filter(directives)?));
    init(subscriber)?;

    Ok(())
}

pub fn init(subscriber: impl Subscriber + Send + Sync + 'static) -> Result<()> {
    tracing::subscriber::set_global_default(subscriber).context("Could not set global default")?;
    LogTracer::init().context("Failed to init LogTracer")?;

    Ok(())
}

/// Constructs an opinionated [`EnvFilter`] with some crates already silenced.
pub fn try_filter(directives: &str) -> Result<EnvFilter, ParseError> {
    /// A filter directive that silences noisy crates.
    ///
    /// A catch-all directive like `debug` is useful for debugging but also enables
    /// the HTTP plumbing underneath the public-IP discovery client, which is very
    /// likely not what you want to see. Restate a crate with a lower filter
    /// (i.e. `hyper_util=debug`) to bring it back.
    const IRRELEVANT_CRATES: &str = "hyper_util=warn,hyper=warn,reqwest=warn";

    if directives.is_empty() {
        EnvFilter::try_new(IRRELEVANT_CRATES)
    } else {
        EnvFilter::try_new(format!("{IRRELEVANT_CRATES},{directives}"))
    }
}

/// Initialises a logger to be used in tests.
pub fn test(directives: &str) -> DefaultGuard {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(directives)
        .set_default()
}
