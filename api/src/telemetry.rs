use tracing::Subscriber;
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, Registry, fmt, layer::SubscriberExt,
};

/// Compose the tracing subscriber. `RUST_LOG` wins when set; otherwise the
/// provided default filter applies.
pub fn get_subscriber(
    default_env_filter: String,
) -> impl Subscriber + Send + Sync {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_env_filter));
    Registry::default().with(env_filter).with(fmt::layer())
}

/// Install the subscriber globally and route `log` records through it.
pub fn init_subscriber(subscriber: impl Subscriber + Send + Sync) {
    LogTracer::init().expect("Failed to set log tracer");
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");
}

/// Log-and-swallow for periodic tasks where one failed iteration must not
/// stop the loop.
pub fn log_error(e: anyhow::Error) {
    tracing::error!("{e:#}");
}
